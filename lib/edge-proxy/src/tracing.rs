//! Distributed trace context
//!
//! Incoming W3C `traceparent` and B3 (multi-header or single `b3`) contexts
//! are continued; otherwise a new root is started. Every request gets an
//! `x-request-id`.

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use edge_api::v1::options::{ListenerTracing, RouteTracing};
use hyper::header::{HeaderMap, HeaderValue};
use opentelemetry::trace::{SpanId, TraceId};
use tracing::{error, info};

pub const TRACEPARENT: &str = "traceparent";
pub const REQUEST_ID: &str = "x-request-id";
const B3_TRACE_ID: &str = "x-b3-traceid";
const B3_SPAN_ID: &str = "x-b3-spanid";
const B3_PARENT_SPAN_ID: &str = "x-b3-parentspanid";
const B3_SAMPLED: &str = "x-b3-sampled";
const B3_SINGLE: &str = "b3";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub sampled: bool,
}

impl TraceContext {
    /// Start a new trace, sampled with the given probability (percent)
    pub fn new_root(sampling_percentage: f64) -> Self {
        Self {
            trace_id: TraceId::from_bytes(random_non_zero()),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled: rand::random::<f64>() * 100.0 < sampling_percentage,
        }
    }

    /// Context extracted from W3C or B3 headers, W3C first
    pub fn extract(headers: &HeaderMap) -> Option<Self> {
        header(headers, TRACEPARENT)
            .and_then(Self::from_traceparent)
            .or_else(|| Self::from_b3_multi(headers))
            .or_else(|| header(headers, B3_SINGLE).and_then(Self::from_b3_single))
    }

    // version-traceid-spanid-flags
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if version.len() != 2 || version == "ff" || trace_id.len() != 32 || span_id.len() != 16 {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;
        Some(Self {
            trace_id: parse_trace_id(trace_id)?,
            span_id: parse_span_id(span_id)?,
            parent_span_id: None,
            sampled: flags & 0x01 == 0x01,
        })
    }

    fn from_b3_multi(headers: &HeaderMap) -> Option<Self> {
        let trace_id = parse_trace_id(header(headers, B3_TRACE_ID)?)?;
        let span_id = parse_span_id(header(headers, B3_SPAN_ID)?)?;
        Some(Self {
            trace_id,
            span_id,
            parent_span_id: header(headers, B3_PARENT_SPAN_ID).and_then(parse_span_id),
            sampled: header(headers, B3_SAMPLED).map_or(true, |s| s == "1" || s == "true"),
        })
    }

    // traceid-spanid[-sampled[-parentspanid]]
    fn from_b3_single(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let trace_id = parse_trace_id(parts.next()?)?;
        let span_id = parse_span_id(parts.next()?)?;
        let sampled = parts.next().map_or(true, |s| s == "1" || s == "d");
        Some(Self {
            trace_id,
            span_id,
            parent_span_id: parts.next().and_then(parse_span_id),
            sampled,
        })
    }

    /// Span for the hop to the upstream
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
        }
    }

    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }

    /// Write W3C and B3 headers for the upstream request
    pub fn inject(&self, headers: &mut HeaderMap) {
        let mut set = |name: &'static str, value: String| {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        };
        set(TRACEPARENT, self.traceparent());
        set(B3_TRACE_ID, self.trace_id.to_string());
        set(B3_SPAN_ID, self.span_id.to_string());
        set(B3_SAMPLED, if self.sampled { "1" } else { "0" }.to_string());
        if let Some(parent) = self.parent_span_id {
            set(B3_PARENT_SPAN_ID, parent.to_string());
        }
    }
}

/// Span name: the route decorator when set, otherwise `{authority}{path}`
pub fn span_name(route: Option<&RouteTracing>, authority: &str, path: &str) -> String {
    route
        .and_then(|r| r.route_descriptor.clone())
        .unwrap_or_else(|| format!("{}{}", authority, path))
}

/// Existing `x-request-id` or a fresh UUID, which is also set on `headers`
pub fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(id) = header(headers, REQUEST_ID) {
        return id.to_string();
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(REQUEST_ID, value);
    }
    id
}

/// Span tags copied from request headers
pub fn header_tags(config: &ListenerTracing, headers: &HeaderMap) -> Vec<(String, String)> {
    config
        .request_headers_for_tags
        .iter()
        .filter_map(|name| header(headers, name).map(|v| (name.clone(), v.to_string())))
        .collect()
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_trace_id(hex: &str) -> Option<TraceId> {
    // 64-bit B3 ids are left-padded
    if hex.len() != 16 && hex.len() != 32 {
        return None;
    }
    TraceId::from_hex(hex).ok().filter(|id| *id != TraceId::INVALID)
}

fn parse_span_id(hex: &str) -> Option<SpanId> {
    if hex.len() != 16 {
        return None;
    }
    SpanId::from_hex(hex).ok().filter(|id| *id != SpanId::INVALID)
}

fn random_non_zero<const N: usize>() -> [u8; N] {
    loop {
        let mut bytes = [0u8; N];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        if bytes.iter().any(|b| *b != 0) {
            return bytes;
        }
    }
}

fn new_span_id() -> SpanId {
    SpanId::from_bytes(random_non_zero())
}

/// Logs each request with its trace id
pub struct TracingMiddleware {
    config: ListenerTracing,
}

impl TracingMiddleware {
    pub fn new(config: ListenerTracing) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "TracingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        if context.get_metadata("trace_id").is_none() {
            let mut headers = HeaderMap::new();
            for (k, v) in &context.request_headers {
                if let (Ok(name), Ok(value)) = (
                    hyper::header::HeaderName::from_bytes(k.as_bytes()),
                    HeaderValue::from_str(v),
                ) {
                    headers.insert(name, value);
                }
            }
            let trace = TraceContext::extract(&headers)
                .unwrap_or_else(|| TraceContext::new_root(self.config.random_sampling_percentage));
            context.set_metadata("trace_id", trace.trace_id.to_string());
            context.set_metadata("span_id", trace.span_id.to_string());
        }
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        let trace_id = context.get_metadata("trace_id").unwrap_or_default();
        if self.config.verbose || status >= 500 {
            info!(
                trace_id = %trace_id,
                span = %context.get_metadata("span_name").unwrap_or_default(),
                status = status,
                method = %context.method,
                path = %context.path,
                "Request traced"
            );
        }
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        error!(
            trace_id = %context.get_metadata("trace_id").unwrap_or_default(),
            error = %error,
            method = %context.method,
            path = %context.path,
            "Request error"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN: &str = "00f067aa0ba902b7";

    #[test]
    fn test_traceparent_round_trip() {
        let value = format!("00-{}-{}-01", TRACE, SPAN);
        let ctx = TraceContext::from_traceparent(&value).unwrap();
        assert_eq!(ctx.trace_id.to_string(), TRACE);
        assert_eq!(ctx.span_id.to_string(), SPAN);
        assert!(ctx.sampled);
        assert_eq!(ctx.traceparent(), value);
    }

    #[test]
    fn test_invalid_traceparent() {
        assert!(TraceContext::from_traceparent("invalid-format").is_none());
        assert!(TraceContext::from_traceparent(&format!("00-{}-{}-01", "0".repeat(32), SPAN)).is_none());
        assert!(TraceContext::from_traceparent(&format!("ff-{}-{}-01", TRACE, SPAN)).is_none());
        assert!(TraceContext::from_traceparent(&format!("00-{}-{}", TRACE, SPAN)).is_none());
    }

    #[test]
    fn test_b3_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(B3_TRACE_ID, HeaderValue::from_static("a3ce929d0e0e4736"));
        headers.insert(B3_SPAN_ID, HeaderValue::from_static(SPAN));
        headers.insert(B3_SAMPLED, HeaderValue::from_static("0"));
        let ctx = TraceContext::extract(&headers).unwrap();
        assert_eq!(ctx.trace_id.to_string(), "0000000000000000a3ce929d0e0e4736");
        assert!(!ctx.sampled);

        let mut single = HeaderMap::new();
        single.insert(
            B3_SINGLE,
            HeaderValue::from_str(&format!("{}-{}-1", TRACE, SPAN)).unwrap(),
        );
        let ctx = TraceContext::extract(&single).unwrap();
        assert_eq!(ctx.trace_id.to_string(), TRACE);
        assert!(ctx.sampled);
    }

    #[test]
    fn test_w3c_preferred_over_b3() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TRACEPARENT,
            HeaderValue::from_str(&format!("00-{}-{}-00", TRACE, SPAN)).unwrap(),
        );
        headers.insert(B3_TRACE_ID, HeaderValue::from_static("a3ce929d0e0e4736"));
        headers.insert(B3_SPAN_ID, HeaderValue::from_static(SPAN));
        let ctx = TraceContext::extract(&headers).unwrap();
        assert_eq!(ctx.trace_id.to_string(), TRACE);
        assert!(!ctx.sampled);
    }

    #[test]
    fn test_child_and_inject() {
        let root = TraceContext::new_root(100.0);
        assert!(root.sampled);
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));

        let mut headers = HeaderMap::new();
        child.inject(&mut headers);
        let extracted = TraceContext::extract(&headers).unwrap();
        assert_eq!(extracted.trace_id, root.trace_id);
        assert_eq!(extracted.span_id, child.span_id);
        assert_eq!(headers[B3_PARENT_SPAN_ID], root.span_id.to_string().as_str());

        assert!(!TraceContext::new_root(0.0).sampled);
    }

    #[test]
    fn test_request_id() {
        let mut headers = HeaderMap::new();
        let id = ensure_request_id(&mut headers);
        assert_eq!(id.len(), 36);
        assert_eq!(ensure_request_id(&mut headers), id);
    }

    #[test]
    fn test_span_name() {
        let decorated = RouteTracing {
            route_descriptor: Some("checkout".into()),
            propagate: true,
        };
        assert_eq!(span_name(Some(&decorated), "shop.example.com", "/cart"), "checkout");
        assert_eq!(span_name(None, "shop.example.com", "/cart"), "shop.example.com/cart");
    }

    #[tokio::test]
    async fn test_tracing_middleware_continues_trace() {
        let req = hyper::Request::builder()
            .uri("/api")
            .header(TRACEPARENT, format!("00-{}-{}-01", TRACE, SPAN))
            .body(())
            .unwrap();
        let context = MiddlewareContext::from_request("l", &req, "127.0.0.1:1".parse().unwrap());
        let middleware = TracingMiddleware::new(ListenerTracing::default());
        middleware.on_request(&context).await.unwrap();
        assert_eq!(context.get_metadata("trace_id").unwrap(), TRACE);
        assert!(middleware.on_response(&context, 200).await.is_ok());
        assert!(middleware.on_error(&context, "boom").await.is_ok());
    }
}
