//! Upstream request forwarding
//!
//! Plain HTTP goes through pooled clients. Clusters with TLS origination or
//! an HTTP CONNECT tunnel get a dedicated connection per request. Retries
//! select a fresh host for every attempt so a failing host is not retried
//! against.

use crate::cluster::{Host, UpstreamCluster};
use crate::error::ProxyError;
use crate::metrics::MetricsCollector;
use crate::tls;
use crate::Result;
use edge_api::v1::options::RetryPolicy;
use edge_api::xds::{HttpConnectTunnel, RoutePolicies, UpstreamTls};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{HeaderMap, Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// A buffered request ready to be sent upstream, possibly more than once
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamResponse {
    pub response: Response<Bytes>,
    pub host: Arc<Host>,
    pub attempts: u32,
}

/// Trailers the upstream sent after the body, kept as a response extension
#[derive(Clone, Debug, Default)]
pub struct UpstreamTrailers(pub HeaderMap);

type CachedTls = (UpstreamTls, bool, Arc<ClientConfig>);

pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    h2_client: Client<HttpConnector, Full<Bytes>>,
    tls_configs: Mutex<HashMap<String, CachedTls>>,
    metrics: Option<MetricsCollector>,
}

impl RequestForwarder {
    pub fn new(metrics: Option<MetricsCollector>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(DEFAULT_CONNECT_TIMEOUT));
        connector.set_keepalive(Some(Duration::from_secs(30)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector.clone());
        let h2_client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build::<_, Full<Bytes>>(connector);

        Self {
            client,
            h2_client,
            tls_configs: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Send `request` to hosts of `cluster`, retrying per the route policy.
    /// `select_host` is called once per attempt.
    pub async fn forward(
        &self,
        cluster: &UpstreamCluster,
        request: &OutboundRequest,
        policies: &RoutePolicies,
        select_host: impl Fn() -> Result<Arc<Host>>,
    ) -> Result<UpstreamResponse> {
        let retry = policies.retries.as_ref();
        let max_attempts = 1 + retry.map(|r| r.max_retries).unwrap_or(0);
        let per_try = policies
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut last: Option<Result<UpstreamResponse>> = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                if let Some(retry) = retry {
                    tokio::time::sleep(backoff(retry, attempt - 1)).await;
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .upstream_rq_retry_total
                        .with_label_values(&[cluster.name()])
                        .inc();
                }
            }

            let host = select_host()?;
            let _guard = host.start_request();
            let is_last = attempt + 1 == max_attempts;

            match timeout(per_try, self.send_once(cluster, &host, request)).await {
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    cluster.record_response(&host, status);
                    let outcome = UpstreamResponse {
                        response,
                        host: host.clone(),
                        attempts: attempt + 1,
                    };
                    let retryable = retry.is_some_and(|r| r.retry_on_status.contains(&status));
                    if !retryable || is_last {
                        return Ok(outcome);
                    }
                    debug!(cluster = %cluster.name(), host = %host.authority(), status, "Retrying on status");
                    last = Some(Ok(outcome));
                }
                Ok(Err(e)) => {
                    cluster.record_response(&host, 503);
                    warn!(cluster = %cluster.name(), host = %host.authority(), error = %e, "Upstream request failed");
                    last = Some(Err(e));
                }
                Err(_) => {
                    cluster.record_response(&host, 504);
                    warn!(cluster = %cluster.name(), host = %host.authority(), timeout_ms = per_try.as_millis() as u64, "Upstream request timed out");
                    last = Some(Err(ProxyError::Timeout(per_try)));
                }
            }
        }
        last.unwrap_or_else(|| Err(ProxyError::NoHealthyUpstream(cluster.name().to_string())))
    }

    async fn send_once(
        &self,
        cluster: &UpstreamCluster,
        host: &Host,
        request: &OutboundRequest,
    ) -> Result<Response<Bytes>> {
        let config = &cluster.config;
        let tls = host.tls.as_ref().or(config.tls.as_ref());
        let response = if tls.is_some() || config.http_connect_tunnel.is_some() {
            self.send_dedicated(cluster, host, request).await?
        } else {
            let uri = format!("http://{}{}", host.authority(), request.path_and_query);
            let outbound = build_request(request, &uri)?;
            let client = if config.http2 { &self.h2_client } else { &self.client };
            client.request(outbound).await?
        };
        collect_response(response).await
    }

    async fn send_dedicated(
        &self,
        cluster: &UpstreamCluster,
        host: &Host,
        request: &OutboundRequest,
    ) -> Result<Response<Incoming>> {
        let config = &cluster.config;
        let connect_timeout = config
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let mut stream = timeout(connect_timeout, TcpStream::connect(host.authority()))
            .await
            .map_err(|_| ProxyError::UpstreamConnect(format!("{}: connect timeout", host.authority())))?
            .map_err(|e| ProxyError::UpstreamConnect(format!("{}: {}", host.authority(), e)))?;

        // the tunnel target becomes the TLS peer
        let mut tls_peer = host.address.clone();
        if let Some(tunnel) = &config.http_connect_tunnel {
            establish_tunnel(&mut stream, tunnel).await?;
            tls_peer = tunnel_host(&tunnel.hostname);
        }

        let tls = host.tls.as_ref().or(config.tls.as_ref());
        let scheme = if tls.is_some() { "https" } else { "http" };
        let uri = if config.http2 {
            format!("{}://{}{}", scheme, host.authority(), request.path_and_query)
        } else {
            request.path_and_query.clone()
        };
        let outbound = build_request(request, &uri)?;

        match tls {
            Some(upstream_tls) => {
                let key = match host.tls {
                    Some(_) => format!("{}/{}", cluster.name(), host.authority()),
                    None => cluster.name().to_string(),
                };
                let client_config = self.client_config(&key, upstream_tls, config.http2)?;
                let server_name = tls::server_name(upstream_tls, &tls_peer)?;
                let stream = TlsConnector::from(client_config)
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                send_on(stream, config.http2, outbound).await
            }
            None => send_on(stream, config.http2, outbound).await,
        }
    }

    /// Cached per cluster, or per host when the endpoint carries its own TLS
    fn client_config(&self, key: &str, upstream_tls: &UpstreamTls, http2: bool) -> Result<Arc<ClientConfig>> {
        let mut configs = self.tls_configs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((cached_tls, cached_http2, config)) = configs.get(key) {
            if cached_tls == upstream_tls && *cached_http2 == http2 {
                return Ok(config.clone());
            }
        }
        let config = tls::client_config(upstream_tls, http2)?;
        configs.insert(key.to_string(), (upstream_tls.clone(), http2, config.clone()));
        Ok(config)
    }
}

fn build_request(request: &OutboundRequest, uri: &str) -> Result<Request<Full<Bytes>>> {
    let mut outbound = Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .body(Full::new(request.body.clone()))?;
    *outbound.headers_mut() = request.headers.clone();
    Ok(outbound)
}

async fn send_on<S>(stream: S, http2: bool, request: Request<Full<Bytes>>) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    if http2 {
        let (mut sender, connection) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Upstream h2 connection closed");
            }
        });
        Ok(sender.send_request(request).await?)
    } else {
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Upstream connection closed");
            }
        });
        Ok(sender.send_request(request).await?)
    }
}

/// Ask an HTTP proxy to open a tunnel to `tunnel.hostname`
pub async fn establish_tunnel<S>(stream: &mut S, tunnel: &HttpConnectTunnel) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut connect = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
        tunnel.hostname, tunnel.hostname
    );
    for (name, value) in &tunnel.headers {
        connect.push_str(&format!("{}: {}\r\n", name, value));
    }
    connect.push_str("\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 || head.len() + n > MAX_CONNECT_RESPONSE {
            return Err(ProxyError::TunnelRefused {
                target: tunnel.hostname.clone(),
                status: 0,
            });
        }
        head.extend_from_slice(&chunk[..n]);
    }

    let status = String::from_utf8_lossy(&head)
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1).map(str::to_string))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    if !(200..300).contains(&status) {
        return Err(ProxyError::TunnelRefused {
            target: tunnel.hostname.clone(),
            status,
        });
    }
    debug!(target = %tunnel.hostname, "Tunnel established");
    Ok(())
}

fn tunnel_host(hostname: &str) -> String {
    match hostname.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        }
        _ => hostname.to_string(),
    }
}

async fn collect_response(response: Response<Incoming>) -> Result<Response<Bytes>> {
    let (mut parts, body) = response.into_parts();
    let collected = body.collect().await?;
    if let Some(trailers) = collected.trailers() {
        parts.extensions.insert(UpstreamTrailers(trailers.clone()));
    }
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, collected.to_bytes()))
}

/// Backoff before retry number `retry` (0-based), doubling up to the cap
pub fn backoff(policy: &RetryPolicy, retry: u32) -> Duration {
    let exponential = 2u64.saturating_pow(retry);
    let backoff_ms = policy
        .base_interval_ms
        .saturating_mul(exponential)
        .min(policy.max_interval_ms.max(policy.base_interval_ms));
    Duration::from_millis(backoff_ms)
}

pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, including those listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Append the downstream address to `x-forwarded-for`
pub fn append_forwarded_for(headers: &mut HeaderMap, remote: IpAddr) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, remote),
        _ => remote.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Replace `matched_prefix` at the start of `path_and_query` with `rewrite`
pub fn rewrite_path(path_and_query: &str, matched_prefix: Option<&str>, rewrite: Option<&str>) -> String {
    let (Some(prefix), Some(rewrite)) = (matched_prefix, rewrite) else {
        return path_and_query.to_string();
    };
    let Some(rest) = path_and_query.strip_prefix(prefix) else {
        return path_and_query.to_string();
    };
    let joined = if rewrite.ends_with('/') && rest.starts_with('/') {
        format!("{}{}", rewrite, &rest[1..])
    } else {
        format!("{}{}", rewrite, rest)
    };
    if joined.is_empty() || joined.starts_with('?') {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Set the upstream `Host` header
pub fn rewrite_host(headers: &mut HeaderMap, host: &str) {
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(HOST, value);
    }
}
