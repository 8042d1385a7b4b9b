//! HTTP connection manager
//!
//! Every request on an HTTP filter chain runs the same pipeline: route
//! match, CORS preflight, auth, rate limiting, the route action with
//! gRPC-Web or gRPC-JSON conversion, DLP on the response body, then access
//! logging. Failures never escape as errors;
//! they become responses with an Envoy-style response flag.

use crate::access_log::AccessLogEntry;
use crate::access_log::AccessLogger;
use crate::cluster::forward_proxy_host;
use crate::dlp::{DlpMasker, ListenerDlp};
use crate::error::ProxyError;
use crate::ext_auth;
use crate::forwarder::{
    append_forwarded_for, rewrite_host, rewrite_path, strip_hop_by_hop, OutboundRequest,
    X_FORWARDED_PROTO,
};
use crate::grpc::{self, GrpcWebMode, GRPC_WEB_FILTER};
use crate::listener::SharedRuntime;
use crate::metrics::MetricsMiddleware;
use crate::middleware::{LoggingMiddleware, MiddlewareChain, MiddlewareContext};
use crate::rate_limit::{DescriptorContext, RateLimitDecision, RateLimiter};
use crate::router::{CompiledRoute, RequestInfo, Router};
use crate::tracing::{ensure_request_id, header_tags, span_name, TraceContext, TracingMiddleware};
use crate::Result;
use chrono::Utc;
use edge_api::v1::options::{AccessLog, ListenerTracing};
use edge_api::v1::proxy::{DirectResponseAction, RedirectAction};
use edge_api::xds::{EnvoyAction, HttpConnectionManager, RouteConfiguration, WeightedCluster};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{
    HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, SERVER, WWW_AUTHENTICATE,
};
use hyper::{HeaderMap, Request, Response, StatusCode};
use rand::Rng;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_SERVER_NAME: &str = "envoy";
pub const UPSTREAM_SERVICE_TIME: &str = "x-envoy-upstream-service-time";
/// Overrides the remote address as the ring hash / Maglev key
pub const HASH_KEY_HEADER: &str = "x-hash-key";

/// What the pipeline produced for one request
struct Outcome<'a> {
    response: Response<Full<Bytes>>,
    flags: &'static str,
    route: Option<&'a CompiledRoute>,
    cluster: Option<String>,
    upstream_host: Option<String>,
    bytes_received: u64,
    dlp: Option<&'a DlpMasker>,
}

impl<'a> Outcome<'a> {
    fn new(response: Response<Full<Bytes>>) -> Self {
        Self {
            response,
            flags: "-",
            route: None,
            cluster: None,
            upstream_host: None,
            bytes_received: 0,
            dlp: None,
        }
    }

    fn error(error: &ProxyError) -> Self {
        Self {
            flags: error.response_flag(),
            ..Self::new(text_response(error.status_code(), &error.to_string()))
        }
    }
}

pub struct HttpProxy {
    listener: String,
    router: Router,
    listener_dlp: Option<ListenerDlp>,
    tracing: Option<ListenerTracing>,
    server_name: String,
    tls: bool,
    grpc_web: bool,
    access_logger: AccessLogger,
    middleware: MiddlewareChain,
    runtime: SharedRuntime,
}

impl HttpProxy {
    pub fn new(
        listener: &str,
        manager: &HttpConnectionManager,
        route_config: &RouteConfiguration,
        access_logs: &[AccessLog],
        tls: bool,
        runtime: SharedRuntime,
    ) -> Result<Self> {
        let mut middleware = MiddlewareChain::new().add(LoggingMiddleware);
        if let Some(metrics) = &runtime.metrics {
            middleware = middleware.add(MetricsMiddleware::new(metrics.clone()));
        }
        if let Some(tracing) = &manager.tracing {
            middleware = middleware.add(TracingMiddleware::new(tracing.clone()));
        }

        Ok(Self {
            listener: listener.to_string(),
            router: Router::new(route_config)?,
            listener_dlp: manager.listener_dlp.as_ref().map(ListenerDlp::new).transpose()?,
            tracing: manager.tracing.clone(),
            server_name: manager
                .server_name
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
            tls,
            grpc_web: manager.has_filter(GRPC_WEB_FILTER),
            access_logger: AccessLogger::new(access_logs, runtime.access_log_endpoint.as_deref())?,
            middleware,
            runtime,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Serve one downstream request
    pub async fn handle<B>(&self, req: Request<B>, remote: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let start_time = Utc::now();
        let started = Instant::now();
        let (mut parts, body) = req.into_parts();
        ensure_request_id(&mut parts.headers);
        let head = Request::from_parts(parts, ());

        let context = MiddlewareContext::from_request(&self.listener, &head, remote);
        let trace = self.tracing.as_ref().map(|config| {
            let trace = match TraceContext::extract(head.headers()) {
                Some(parent) => parent.child(),
                None => TraceContext::new_root(config.random_sampling_percentage),
            };
            context.set_metadata("trace_id", trace.trace_id.to_string());
            context.set_metadata("span_id", trace.span_id.to_string());
            for (tag, value) in header_tags(config, head.headers()) {
                context.set_metadata(format!("tag.{}", tag), value);
            }
            trace
        });

        let mut outcome = self.process(&head, body, remote, &context, trace.as_ref()).await;

        if let Some(cors) = outcome.route.and_then(|r| r.cors.as_ref()) {
            cors.apply(head.headers(), outcome.response.headers_mut());
        }
        if let Ok(server) = HeaderValue::from_str(&self.server_name) {
            outcome.response.headers_mut().insert(SERVER, server);
        }

        let status = outcome.response.status().as_u16();
        if status >= 500 {
            let reason = String::from_utf8_lossy(&body_bytes(&outcome.response)).to_string();
            self.middleware.on_error(&context, &reason).await;
        }
        self.middleware.on_response(&context, status).await;

        if !self.access_logger.is_empty() {
            let entry = AccessLogEntry {
                start_time,
                method: head.method().to_string(),
                path: head
                    .uri()
                    .path_and_query()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| head.uri().path().to_string()),
                protocol: format!("{:?}", head.version()),
                authority: RequestInfo::from_request(&head).authority.to_string(),
                response_code: status,
                response_flags: outcome.flags.to_string(),
                bytes_received: outcome.bytes_received,
                bytes_sent: outcome.response.body().size_hint().exact().unwrap_or(0),
                duration_ms: started.elapsed().as_millis() as u64,
                upstream_host: outcome.upstream_host.clone(),
                upstream_cluster: outcome.cluster.clone(),
                downstream_remote_address: remote.to_string(),
                route_name: outcome.route.map(|r| r.name().to_string()),
                request_headers: header_map(head.headers()),
                response_headers: header_map(outcome.response.headers()),
            };
            self.access_logger.log(&entry, outcome.dlp).await;
        }
        outcome.response
    }

    async fn process<'a, B>(
        &'a self,
        head: &Request<()>,
        body: B,
        remote: SocketAddr,
        context: &MiddlewareContext,
        trace: Option<&TraceContext>,
    ) -> Outcome<'a>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let info = RequestInfo::from_request(head);
        let Some(matched) = self.router.route(&info) else {
            self.middleware.on_request(context).await;
            debug!(authority = %info.authority, path = %info.path, "No route matched");
            return Outcome::error(&ProxyError::NoRoute {
                host: info.authority.to_string(),
                path: info.path.to_string(),
            });
        };
        let route = matched.route;
        let policies = &route.route.policies;
        let dlp = route
            .dlp
            .as_ref()
            .or_else(|| self.listener_dlp.as_ref().and_then(|d| d.for_request(&info)));

        let cluster_name = match &route.route.action {
            EnvoyAction::Cluster(name) => Some(name.clone()),
            EnvoyAction::WeightedClusters(clusters) => pick_weighted(clusters),
            _ => None,
        };
        context.set_metadata("route", route.name());
        context.set_metadata("virtual_host", matched.virtual_host);
        context.set_metadata(
            "span_name",
            span_name(policies.tracing.as_ref(), info.authority, info.path),
        );
        if let Some(cluster) = &cluster_name {
            context.set_metadata("cluster", cluster.clone());
        }
        self.middleware.on_request(context).await;

        let mut outcome = self
            .dispatch(head, &info, body, remote, route, cluster_name, trace)
            .await;
        outcome.route = Some(route);
        outcome.dlp = dlp;
        if let Some(dlp) = dlp.filter(|d| d.applies_to_body()) {
            mask_body(&mut outcome.response, dlp);
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch<'a, B>(
        &'a self,
        head: &Request<()>,
        info: &RequestInfo<'_>,
        body: B,
        remote: SocketAddr,
        route: &'a CompiledRoute,
        cluster_name: Option<String>,
        trace: Option<&TraceContext>,
    ) -> Outcome<'a>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let policies = &route.route.policies;

        if let Some(cors) = &route.cors {
            if crate::cors::CorsEvaluator::is_preflight(head.method(), head.headers()) {
                if let Some(response) = cors.preflight(head.headers()) {
                    return Outcome::new(response);
                }
            }
        }

        let mut identity = None;
        if let Some(policy) = &policies.ext_auth {
            match self.runtime.authenticator.check(policy, head.headers()).await {
                Ok(found) => identity = Some(found),
                Err(e) => {
                    debug!(route = %route.name(), error = %e, "Request denied");
                    let mut outcome = Outcome::error(&e);
                    if let Some(challenge) = ext_auth::challenge(policy) {
                        outcome.response.headers_mut().insert(WWW_AUTHENTICATE, challenge);
                    }
                    return outcome;
                }
            }
        }

        if let Some(policy) = &policies.rate_limit {
            let ctx = DescriptorContext {
                remote_address: remote.ip(),
                headers: head.headers(),
            };
            if let RateLimitDecision::Limited { rule, retry_after } =
                self.runtime.rate_limiter.check(route.name(), policy, &ctx)
            {
                if let Some(metrics) = &self.runtime.metrics {
                    metrics
                        .http_rate_limited_total
                        .with_label_values(&[route.name()])
                        .inc();
                }
                debug!(route = %route.name(), rule = %rule, "Request rate limited");
                return Outcome {
                    flags: "RL",
                    ..Outcome::new(RateLimiter::limited_response(retry_after))
                };
            }
        }

        match &route.route.action {
            EnvoyAction::Redirect(redirect) => {
                return Outcome::new(self.redirect_response(redirect, head, info));
            }
            EnvoyAction::DirectResponse(direct) => return Outcome::new(direct_response(direct)),
            EnvoyAction::Cluster(_) | EnvoyAction::WeightedClusters(_) => {}
        }

        let Some(cluster_name) = cluster_name else {
            return Outcome::error(&ProxyError::ClusterNotFound(route.name().to_string()));
        };
        let Some(cluster) = self.runtime.clusters.get(&cluster_name).await else {
            return Outcome {
                cluster: Some(cluster_name.clone()),
                ..Outcome::error(&ProxyError::ClusterNotFound(cluster_name))
            };
        };

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return Outcome {
                    flags: "DC",
                    ..Outcome::new(text_response(StatusCode::BAD_REQUEST, "invalid request body"))
                };
            }
        };
        let bytes_received = body.len() as u64;

        let mut headers = head.headers().clone();
        strip_hop_by_hop(&mut headers);
        append_forwarded_for(&mut headers, remote.ip());
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if self.tls { "https" } else { "http" }),
        );
        if let Some(host) = &policies.host_rewrite {
            rewrite_host(&mut headers, host);
        }
        if let Some(identity) = identity {
            identity.apply(&mut headers);
        }
        if let Some(trace) = trace {
            if policies.tracing.as_ref().map_or(true, |t| t.propagate) {
                trace.inject(&mut headers);
            }
        }
        let path_and_query = head
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        let web = GrpcWebMode::from_headers(head.headers()).filter(|_| self.grpc_web);
        let transcode = match (web, cluster.transcoder()) {
            (None, Some(transcoder)) => transcoder
                .method(head.method(), path_and_query)
                .map(|method| (transcoder.clone(), method.clone())),
            _ => None,
        };
        let converted = match (web, &transcode) {
            (Some(mode), _) => grpc::web_request(mode, &mut headers, body),
            (None, Some((transcoder, method))) => transcoder.encode_request(method, &mut headers, &body),
            (None, None) => Ok(body),
        };
        let body = match converted {
            Ok(body) => body,
            Err(e) => {
                debug!(route = %route.name(), error = %e, "Rejecting gRPC request");
                return Outcome {
                    cluster: Some(cluster_name),
                    bytes_received,
                    ..Outcome::error(&e)
                };
            }
        };

        let request = OutboundRequest {
            method: head.method().clone(),
            path_and_query: rewrite_path(
                path_and_query,
                route.matcher.prefix(),
                policies.prefix_rewrite.as_deref(),
            ),
            headers,
            body,
        };

        let hash_key = head
            .headers()
            .get(HASH_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| remote.ip().to_string());
        let authority = info.authority.to_string();
        let select_host = || {
            if cluster.is_forward_proxy() {
                return forward_proxy_host(&authority)
                    .ok_or_else(|| ProxyError::NoHealthyUpstream(cluster.name().to_string()));
            }
            let (host, panic) = cluster.select_host_with_panic(Some(&hash_key))?;
            if panic {
                if let Some(metrics) = &self.runtime.metrics {
                    metrics
                        .upstream_panic_total
                        .with_label_values(&[cluster.name()])
                        .inc();
                }
            }
            Ok(host)
        };

        let upstream_started = Instant::now();
        match self
            .runtime
            .forwarder
            .forward(&cluster, &request, policies, select_host)
            .await
        {
            Ok(upstream) => {
                let service_time = upstream_started.elapsed().as_millis() as u64;
                let response = match (web, &transcode) {
                    (Some(mode), _) => Ok(grpc::web_response(mode, upstream.response)),
                    (None, Some((transcoder, method))) => transcoder.decode_response(method, upstream.response),
                    (None, None) => Ok(upstream.response),
                };
                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(cluster = %cluster_name, error = %e, "Failed to transcode upstream reply");
                        return Outcome {
                            cluster: Some(cluster_name),
                            upstream_host: Some(upstream.host.authority()),
                            bytes_received,
                            ..Outcome::new(text_response(StatusCode::BAD_GATEWAY, &e.to_string()))
                        };
                    }
                };
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                parts
                    .headers
                    .insert(UPSTREAM_SERVICE_TIME, HeaderValue::from(service_time));
                Outcome {
                    cluster: Some(cluster_name),
                    upstream_host: Some(upstream.host.authority()),
                    bytes_received,
                    ..Outcome::new(Response::from_parts(parts, Full::new(body)))
                }
            }
            Err(e) => {
                debug!(cluster = %cluster_name, error = %e, "Upstream request failed");
                Outcome {
                    cluster: Some(cluster_name),
                    bytes_received,
                    ..Outcome::error(&e)
                }
            }
        }
    }

    fn redirect_response(
        &self,
        redirect: &RedirectAction,
        head: &Request<()>,
        info: &RequestInfo<'_>,
    ) -> Response<Full<Bytes>> {
        let scheme = if redirect.https_redirect || self.tls { "https" } else { "http" };
        let host = redirect.host_redirect.as_deref().unwrap_or(info.authority);
        let path = match &redirect.path_redirect {
            Some(path) => path.clone(),
            None => head
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "/".to_string()),
        };
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() =
            StatusCode::from_u16(redirect.response_code).unwrap_or(StatusCode::MOVED_PERMANENTLY);
        if let Ok(location) = HeaderValue::from_str(&format!("{}://{}{}", scheme, host, path)) {
            response.headers_mut().insert(LOCATION, location);
        }
        response
    }
}

fn direct_response(direct: &DirectResponseAction) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(direct.status).unwrap_or(StatusCode::OK);
    let mut response = text_response(status, &direct.body);
    if direct.body.is_empty() {
        response.headers_mut().remove(CONTENT_TYPE);
    }
    response
}

/// Plain-text response with `body` followed by a newline
pub fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let body = if body.is_empty() || body.ends_with('\n') {
        body.to_string()
    } else {
        format!("{}\n", body)
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Weighted random choice; `None` when every weight is zero
fn pick_weighted(clusters: &[WeightedCluster]) -> Option<String> {
    let total: u64 = clusters.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        return None;
    }
    let mut point = rand::thread_rng().gen_range(0..total);
    for cluster in clusters {
        let weight = u64::from(cluster.weight);
        if point < weight {
            return Some(cluster.name.clone());
        }
        point -= weight;
    }
    None
}

fn body_bytes(response: &Response<Full<Bytes>>) -> Bytes {
    // Full yields its single frame without waiting
    let mut body = response.body().clone();
    match futures::FutureExt::now_or_never(body.frame()) {
        Some(Some(Ok(frame))) => frame.into_data().unwrap_or_default(),
        _ => Bytes::new(),
    }
}

fn mask_body(response: &mut Response<Full<Bytes>>, dlp: &DlpMasker) {
    let body = body_bytes(response);
    if let Some(masked) = dlp.mask_bytes(&body) {
        let len = masked.len();
        *response.body_mut() = Full::new(Bytes::from(masked));
        response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::SharedRuntime;
    use crate::ext_auth::tests::{basic, basic_policy};
    use crate::ext_auth::USER_ID_HEADER;
    use crate::rate_limit::RATE_LIMITED_HEADER;
    use edge_api::v1::options::rate_limit::{Descriptor, TimeUnit};
    use edge_api::v1::options::{CorsPolicy, DlpAction, DlpActionType, DlpConfig, RateLimitPolicy, RateLimitRule};
    use edge_api::v1::proxy::Matcher;
    use edge_api::xds::{
        Cluster, ClusterLoadAssignment, EnvoyRoute, EnvoyVirtualHost, LbEndpoint,
        LocalityLbEndpoints, RoutePolicies, Snapshot,
    };
    use crate::transcoder::tests::bookstore_config;
    use edge_api::v1::options::GrpcJsonTranscoder;
    use edge_api::xds::{FilterStage, HttpFilter};
    use http_body_util::{Empty, StreamBody};
    use hyper::body::{Frame, Incoming};
    use hyper::server::conn::http2;
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const REMOTE: &str = "10.0.0.7:41000";

    /// Replies with the request line's path and the request head
    async fn upstream(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                            break;
                        }
                        head.push(byte[0]);
                    }
                    let head = String::from_utf8_lossy(&head).to_string();
                    let reply = if body.is_empty() { head } else { body.to_string() };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        reply.len(),
                        reply
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    fn route(name: &str, matcher: Matcher, action: EnvoyAction, policies: RoutePolicies) -> EnvoyRoute {
        EnvoyRoute {
            name: name.into(),
            matcher,
            action,
            policies,
        }
    }

    async fn proxy(routes: Vec<EnvoyRoute>, port: Option<u16>) -> HttpProxy {
        let runtime = SharedRuntime::new(None, None);
        if let Some(port) = port {
            runtime
                .clusters
                .update(&Snapshot {
                    version: "v1".into(),
                    clusters: vec![Cluster {
                        name: "petstore_default".into(),
                        ..Default::default()
                    }],
                    cluster_load_assignments: vec![ClusterLoadAssignment {
                        cluster_name: "petstore_default".into(),
                        endpoints: vec![LocalityLbEndpoints {
                            lb_endpoints: vec![LbEndpoint::new("127.0.0.1", port)],
                            ..Default::default()
                        }],
                    }],
                    ..Default::default()
                })
                .await;
        }
        let route_config = RouteConfiguration {
            name: "listener-::-8080-routes".into(),
            virtual_hosts: vec![EnvoyVirtualHost {
                name: "default.petstore".into(),
                domains: vec!["*".into()],
                routes,
            }],
        };
        HttpProxy::new(
            "listener-::-8080",
            &HttpConnectionManager {
                route_config_name: route_config.name.clone(),
                ..Default::default()
            },
            &route_config,
            &[],
            false,
            runtime,
        )
        .unwrap()
    }

    fn request(method: &str, path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header("host", "petstore.example.com")
            .body(Empty::new())
            .unwrap()
    }

    async fn text(response: Response<Full<Bytes>>) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_no_route() {
        let proxy = proxy(
            vec![route(
                "api",
                Matcher::prefix("/api"),
                EnvoyAction::Cluster("petstore_default".into()),
                RoutePolicies::default(),
            )],
            None,
        )
        .await;
        let response = proxy.handle(request("GET", "/other"), REMOTE.parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[SERVER], "envoy");
    }

    #[tokio::test]
    async fn test_missing_cluster_is_503() {
        let proxy = proxy(
            vec![route(
                "api",
                Matcher::prefix("/"),
                EnvoyAction::Cluster("missing_default".into()),
                RoutePolicies::default(),
            )],
            None,
        )
        .await;
        let response = proxy.handle(request("GET", "/"), REMOTE.parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_forwards_with_prefix_rewrite_and_forwarded_headers() {
        let port = upstream("").await;
        let proxy = proxy(
            vec![route(
                "api",
                Matcher::prefix("/api"),
                EnvoyAction::Cluster("petstore_default".into()),
                RoutePolicies {
                    prefix_rewrite: Some("/v2".into()),
                    ..Default::default()
                },
            )],
            Some(port),
        )
        .await;

        let response = proxy
            .handle(request("GET", "/api/pets?limit=1"), REMOTE.parse().unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(UPSTREAM_SERVICE_TIME));
        let head = text(response).await.to_ascii_lowercase();
        assert!(head.starts_with("get /v2/pets?limit=1 http/1.1"));
        assert!(head.contains("x-forwarded-for: 10.0.0.7"));
        assert!(head.contains("x-forwarded-proto: http"));
        assert!(head.contains("x-request-id: "));
    }

    #[tokio::test]
    async fn test_redirect_and_direct_response() {
        let proxy = proxy(
            vec![
                route(
                    "redirect",
                    Matcher::prefix("/old"),
                    EnvoyAction::Redirect(RedirectAction {
                        host_redirect: None,
                        path_redirect: Some("/new".into()),
                        https_redirect: true,
                        response_code: 302,
                    }),
                    RoutePolicies::default(),
                ),
                route(
                    "direct",
                    Matcher::exact("/teapot"),
                    EnvoyAction::DirectResponse(DirectResponseAction {
                        status: 418,
                        body: "short and stout".into(),
                    }),
                    RoutePolicies::default(),
                ),
            ],
            None,
        )
        .await;

        let response = proxy.handle(request("GET", "/old/page"), REMOTE.parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "https://petstore.example.com/new");

        let response = proxy.handle(request("GET", "/teapot"), REMOTE.parse().unwrap()).await;
        assert_eq!(response.status().as_u16(), 418);
        assert_eq!(text(response).await, "short and stout\n");
    }

    #[tokio::test]
    async fn test_auth_gates_upstream() {
        let port = upstream("").await;
        let proxy = proxy(
            vec![route(
                "private",
                Matcher::prefix("/"),
                EnvoyAction::Cluster("petstore_default".into()),
                RoutePolicies {
                    ext_auth: Some(basic_policy()),
                    ..Default::default()
                },
            )],
            Some(port),
        )
        .await;

        let denied = proxy.handle(request("GET", "/pets"), REMOTE.parse().unwrap()).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(denied.headers()[WWW_AUTHENTICATE], "Basic realm=\"petstore\"");

        let mut req = Request::builder()
            .method("GET")
            .uri("/pets")
            .header("host", "petstore.example.com")
            .header(USER_ID_HEADER, "mallory")
            .body(Empty::<Bytes>::new())
            .unwrap();
        req.headers_mut().extend(basic("alice", "secret"));
        let allowed = proxy.handle(req, REMOTE.parse().unwrap()).await;
        assert_eq!(allowed.status(), StatusCode::OK);
        let head = text(allowed).await;
        assert!(head.contains("x-user-id: alice"));
        assert!(!head.contains("mallory"));
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let proxy = proxy(
            vec![route(
                "limited",
                Matcher::prefix("/"),
                EnvoyAction::DirectResponse(DirectResponseAction {
                    status: 200,
                    body: "ok".into(),
                }),
                RoutePolicies {
                    rate_limit: Some(RateLimitPolicy {
                        rules: vec![RateLimitRule {
                            name: "per-client".into(),
                            descriptor: Descriptor::RemoteAddress,
                            requests_per_unit: 1,
                            unit: TimeUnit::Hour,
                        }],
                    }),
                    ..Default::default()
                },
            )],
            None,
        )
        .await;

        let first = proxy.handle(request("GET", "/"), REMOTE.parse().unwrap()).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = proxy.handle(request("GET", "/"), REMOTE.parse().unwrap()).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[RATE_LIMITED_HEADER], "true");

        let other = proxy.handle(request("GET", "/"), "10.0.0.8:41000".parse().unwrap()).await;
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_preflight_and_actual_request() {
        let proxy = proxy(
            vec![route(
                "cors",
                Matcher::prefix("/"),
                EnvoyAction::DirectResponse(DirectResponseAction {
                    status: 200,
                    body: "ok".into(),
                }),
                RoutePolicies {
                    cors: Some(CorsPolicy {
                        allow_origin: vec!["https://shop.example.com".into()],
                        allow_methods: vec!["GET".into(), "POST".into()],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )],
            None,
        )
        .await;

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/pets")
            .header("host", "petstore.example.com")
            .header("origin", "https://shop.example.com")
            .header("access-control-request-method", "POST")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy.handle(preflight, REMOTE.parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://shop.example.com"
        );

        let actual = Request::builder()
            .uri("/pets")
            .header("host", "petstore.example.com")
            .header("origin", "https://shop.example.com")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy.handle(actual, REMOTE.parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://shop.example.com"
        );
    }

    #[tokio::test]
    async fn test_dlp_masks_upstream_body() {
        let port = upstream("card 4111111111111111 on file").await;
        let proxy = proxy(
            vec![route(
                "dlp",
                Matcher::prefix("/"),
                EnvoyAction::Cluster("petstore_default".into()),
                RoutePolicies {
                    dlp: Some(DlpConfig {
                        actions: vec![DlpAction {
                            action_type: DlpActionType::AllCreditCards,
                            custom_action: None,
                            shadow: false,
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )],
            Some(port),
        )
        .await;

        let response = proxy.handle(request("GET", "/"), REMOTE.parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let length: usize = response.headers()[CONTENT_LENGTH].to_str().unwrap().parse().unwrap();
        let body = text(response).await;
        assert_eq!(body.len(), length);
        assert!(!body.contains("4111111111111111"));
        assert!(body.starts_with("card "));
    }

    /// h2c gRPC server echoing the request message; anything else gets INVALID_ARGUMENT
    async fn grpc_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let is_grpc = req.headers().get(CONTENT_TYPE).is_some_and(|v| v == grpc::GRPC_CONTENT_TYPE);
                        let message = req.into_body().collect().await?.to_bytes();
                        let mut response = Response::builder().header(CONTENT_TYPE, grpc::GRPC_CONTENT_TYPE);
                        let mut trailers = HeaderMap::new();
                        let frames = if is_grpc {
                            trailers.insert(grpc::GRPC_STATUS, HeaderValue::from_static("0"));
                            vec![Frame::data(message), Frame::trailers(trailers)]
                        } else {
                            response = response.header(grpc::GRPC_STATUS, "3");
                            Vec::new()
                        };
                        let body = StreamBody::new(futures::stream::iter(
                            frames.into_iter().map(Ok::<_, Infallible>),
                        ));
                        Ok::<_, hyper::Error>(response.body(body).unwrap())
                    });
                    let _ = http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        port
    }

    async fn grpc_proxy(port: u16, grpc_web: bool, transcoder: Option<GrpcJsonTranscoder>) -> HttpProxy {
        let runtime = SharedRuntime::new(None, None);
        runtime
            .clusters
            .update(&Snapshot {
                version: "v1".into(),
                clusters: vec![Cluster {
                    name: "bookstore_default".into(),
                    http2: true,
                    grpc_json_transcoder: transcoder,
                    ..Default::default()
                }],
                cluster_load_assignments: vec![ClusterLoadAssignment {
                    cluster_name: "bookstore_default".into(),
                    endpoints: vec![LocalityLbEndpoints {
                        lb_endpoints: vec![LbEndpoint::new("127.0.0.1", port)],
                        ..Default::default()
                    }],
                }],
                ..Default::default()
            })
            .await;
        let route_config = RouteConfiguration {
            name: "listener-::-8080-routes".into(),
            virtual_hosts: vec![EnvoyVirtualHost {
                name: "default.bookstore".into(),
                domains: vec!["*".into()],
                routes: vec![route(
                    "grpc",
                    Matcher::prefix("/"),
                    EnvoyAction::Cluster("bookstore_default".into()),
                    RoutePolicies::default(),
                )],
            }],
        };
        let http_filters = if grpc_web {
            vec![HttpFilter {
                name: GRPC_WEB_FILTER.into(),
                stage: FilterStage::Fault,
            }]
        } else {
            Vec::new()
        };
        HttpProxy::new(
            "listener-::-8080",
            &HttpConnectionManager {
                route_config_name: route_config.name.clone(),
                http_filters,
                ..Default::default()
            },
            &route_config,
            &[],
            false,
            runtime,
        )
        .unwrap()
    }

    fn post(path: &str, content_type: &str, body: Bytes) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("host", "bookstore.example.com")
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_grpc_web_bridged_to_grpc() {
        let port = grpc_upstream().await;
        let message = grpc::frame(&[0x08, 0x96, 0x01]);

        let proxy = grpc_proxy(port, true, None).await;
        let response = proxy
            .handle(
                post("/bookstore.Bookstore/GetShelf", "application/grpc-web+proto", message.clone()),
                REMOTE.parse().unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/grpc-web+proto");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let frames = grpc::frames(&body).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, &[0x08, 0x96, 0x01]);
        assert!(frames[1].is_trailer());
        assert_eq!(frames[1].payload, b"grpc-status:0\r\n");

        // without the filter the request reaches the upstream untouched
        let proxy = grpc_proxy(port, false, None).await;
        let response = proxy
            .handle(
                post("/bookstore.Bookstore/GetShelf", "application/grpc-web+proto", message),
                REMOTE.parse().unwrap(),
            )
            .await;
        assert_eq!(response.headers()[grpc::GRPC_STATUS], "3");
    }

    #[tokio::test]
    async fn test_json_transcoded_to_grpc() {
        let port = grpc_upstream().await;
        let proxy = grpc_proxy(port, true, Some(bookstore_config())).await;

        let response = proxy
            .handle(
                post("/bookstore.Bookstore/GetShelf", "application/json", Bytes::from(r#"{"shelf": "150"}"#)),
                REMOTE.parse().unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
        assert_eq!(body, serde_json::json!({"id": "150"}));

        let response = proxy
            .handle(
                post("/bookstore.Bookstore/GetShelf", "application/json", Bytes::from("{\"shelf\": [")),
                REMOTE.parse().unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_pick_weighted() {
        let clusters = vec![
            WeightedCluster {
                name: "canary".into(),
                weight: 0,
            },
            WeightedCluster {
                name: "stable".into(),
                weight: 10,
            },
        ];
        for _ in 0..20 {
            assert_eq!(pick_weighted(&clusters).as_deref(), Some("stable"));
        }
        assert_eq!(pick_weighted(&clusters[..1]), None);
    }
}
