//! Discovery server
//!
//! Data-plane nodes long-poll `GET /v1/discovery/{node}?version={known}`. The
//! request completes with the node's snapshot as JSON as soon as its version
//! differs from `known`, or with `304 Not Modified` once the poll times out.

use edge_translator::{SnapshotCache, TranslatorMetrics};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DISCOVERY_PATH: &str = "/v1/discovery/";
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DiscoveryServer {
    cache: SnapshotCache,
    metrics: TranslatorMetrics,
    poll_timeout: Duration,
}

impl DiscoveryServer {
    pub fn new(cache: SnapshotCache, metrics: TranslatorMetrics) -> Self {
        Self {
            cache,
            metrics,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!("Discovery server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("Discovery server stopped");
                    return Ok(());
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Error serving discovery connection from {}: {}", peer_addr, e);
                }
            });
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        }

        let path = req.uri().path();
        match path {
            "/healthz" => text(StatusCode::OK, "OK\n"),
            "/metrics" => match self.metrics.gather() {
                Ok(body) => {
                    let mut response = Response::new(Full::new(Bytes::from(body)));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                Err(e) => {
                    warn!("Failed to gather metrics: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "failed to gather metrics\n")
                }
            },
            "/v1/nodes" => json(&self.cache.nodes().await),
            _ => match path.strip_prefix(DISCOVERY_PATH) {
                Some(node) if !node.is_empty() && !node.contains('/') => {
                    let known = query_param(req.uri().query(), "version");
                    self.discover(node, known.as_deref()).await
                }
                _ => text(StatusCode::NOT_FOUND, "not found\n"),
            },
        }
    }

    async fn discover(&self, node: &str, known: Option<&str>) -> Response<Full<Bytes>> {
        debug!(node = %node, known = ?known, "Discovery request");
        match self.cache.next_version(node, known, self.poll_timeout).await {
            Some(snapshot) => {
                debug!(node = %node, version = %snapshot.version, "Sending snapshot");
                json(snapshot.as_ref())
            }
            None => {
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::NOT_MODIFIED;
                response
            }
        }
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to encode response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed\n")
        }
    }
}
