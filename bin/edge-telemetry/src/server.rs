//! HTTP surface of the telemetry service

use crate::sink::{LineTooLong, TelemetrySink};
use edge_proxy::access_log::{ACCESS_LOGS_PATH, LOG_NAME_HEADER};
use edge_proxy::metrics::{METRICS_PATH, NODE_ID_HEADER};
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const NODES_PATH: &str = "/v1/nodes/";

pub async fn serve(listener: TcpListener, sink: Arc<TelemetrySink>) -> anyhow::Result<()> {
    info!("Telemetry server listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let sink = sink.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let sink = sink.clone();
                async move { Ok::<_, Infallible>(handle(&sink, req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving telemetry connection from {}: {}", peer_addr, e);
            }
        });
    }
}

pub async fn handle<B>(sink: &TelemetrySink, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => text(StatusCode::OK, "OK\n"),
        (&Method::GET, "/metrics") => match sink.gather() {
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
        (&Method::POST, ACCESS_LOGS_PATH) => {
            let log_name = header(&req, LOG_NAME_HEADER).unwrap_or_else(|| "default".to_string());
            match sink.receive_access_logs(&log_name, req.into_body()).await {
                Ok(summary) => json(&summary),
                Err(e) => {
                    warn!(log_name = %log_name, error = %e, "Access log stream failed");
                    stream_failed(&e)
                }
            }
        }
        (&Method::POST, METRICS_PATH) => {
            let Some(node) = header(&req, NODE_ID_HEADER) else {
                return text(StatusCode::BAD_REQUEST, "missing x-node-id\n");
            };
            match sink.receive_metrics(&node, req.into_body()).await {
                Ok(summary) => json(&summary),
                Err(e) => {
                    warn!(node = %node, error = %e, "Metrics stream failed");
                    stream_failed(&e)
                }
            }
        }
        (&Method::GET, "/v1/nodes") => json(&sink.nodes().await),
        (&Method::GET, _) => match path
            .strip_prefix(NODES_PATH)
            .and_then(|rest| rest.strip_suffix("/metrics"))
        {
            Some(node) => match sink.node_metrics(node).await {
                Some(samples) => json(&samples),
                None => text(StatusCode::NOT_FOUND, "unknown node\n"),
            },
            None => text(StatusCode::NOT_FOUND, "not found\n"),
        },
        _ => text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n"),
    }
}

fn stream_failed(e: &anyhow::Error) -> Response<Full<Bytes>> {
    if e.downcast_ref::<LineTooLong>().is_some() {
        return text(StatusCode::PAYLOAD_TOO_LARGE, "stream line too long\n");
    }
    text(StatusCode::BAD_REQUEST, "stream failed\n")
}

fn header<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
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
