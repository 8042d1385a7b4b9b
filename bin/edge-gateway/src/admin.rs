//! Admin endpoints of the gateway
//!
//! `/healthz`, `/ready`, `/metrics`, `/clusters` and `/config_dump`.

use edge_api::xds::Snapshot;
use edge_proxy::{ClusterManager, MetricsCollector};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct ClusterStatus {
    name: String,
    hosts: Vec<HostStatus>,
}

#[derive(Serialize)]
struct HostStatus {
    address: String,
    priority: u32,
    healthy: bool,
    ejected: bool,
    active_requests: usize,
}

pub struct AdminServer {
    metrics: MetricsCollector,
    clusters: Arc<ClusterManager>,
    snapshot: watch::Receiver<Option<Arc<Snapshot>>>,
}

impl AdminServer {
    pub fn new(
        metrics: MetricsCollector,
        clusters: Arc<ClusterManager>,
        snapshot: watch::Receiver<Option<Arc<Snapshot>>>,
    ) -> Self {
        Self {
            metrics,
            clusters,
            snapshot,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!("Admin server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => return Ok(()),
            };

            let admin = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let admin = admin.clone();
                    async move { Ok::<_, Infallible>(admin.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Error serving admin connection from {}: {}", peer_addr, e);
                }
            });
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/healthz" => text(StatusCode::OK, "OK\n"),
            "/ready" => {
                if self.snapshot.borrow().is_some() {
                    text(StatusCode::OK, "LIVE\n")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "awaiting configuration\n")
                }
            }
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
            "/clusters" => {
                let mut statuses = Vec::new();
                for name in self.clusters.names().await {
                    let Some(cluster) = self.clusters.get(&name).await else {
                        continue;
                    };
                    let hosts = cluster
                        .hosts()
                        .iter()
                        .map(|host| HostStatus {
                            address: host.authority(),
                            priority: host.priority,
                            healthy: host.is_healthy(),
                            ejected: host.is_ejected(),
                            active_requests: host.active_requests(),
                        })
                        .collect();
                    statuses.push(ClusterStatus { name, hosts });
                }
                json(&statuses)
            }
            "/config_dump" => {
                let snapshot = self.snapshot.borrow().clone();
                match snapshot {
                    Some(snapshot) => json(snapshot.as_ref()),
                    None => text(StatusCode::SERVICE_UNAVAILABLE, "awaiting configuration\n"),
                }
            }
            _ => text(StatusCode::NOT_FOUND, "not found\n"),
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn json<T: Serialize + ?Sized>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
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
