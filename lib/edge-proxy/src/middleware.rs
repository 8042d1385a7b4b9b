//! Request lifecycle hooks
//!
//! Middleware observes requests after routing data is known and responses
//! once their status is final. It never changes traffic; filters that do
//! (CORS, rate limiting, DLP) run inside [`crate::HttpProxy`].

use anyhow::Result;
use hyper::Request;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, span, Level};

/// Context passed through the middleware chain
#[derive(Clone)]
pub struct MiddlewareContext {
    pub listener: String,
    pub method: String,
    pub path: String,
    pub authority: String,
    pub remote_address: SocketAddr,
    pub request_headers: HashMap<String, String>,
    pub started: Instant,
    /// Values set by the proxy (`route`, `cluster`, `upstream_host`) or by middleware
    pub metadata: Arc<Mutex<HashMap<String, String>>>,
}

impl MiddlewareContext {
    pub fn from_request<B>(listener: &str, req: &Request<B>, remote_address: SocketAddr) -> Self {
        let request_headers = req
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let authority = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Self {
            listener: listener.to_string(),
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            authority,
            remote_address,
            request_headers,
            started: Instant::now(),
            metadata: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut m) = self.metadata.lock() {
            m.insert(key.into(), value.into());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, _context: &MiddlewareContext) -> Result<()> {
        Ok(())
    }

    async fn on_response(&self, _context: &MiddlewareContext, _status: u16) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _context: &MiddlewareContext, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Middleware run in order for requests and in reverse for responses
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Hook failures are logged and never fail the request
    pub async fn on_request(&self, context: &MiddlewareContext) {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            let _guard = span.enter();
            if let Err(e) = mw.on_request(context).await {
                debug!(error = %e, "Middleware on_request failed");
            }
        }
    }

    pub async fn on_response(&self, context: &MiddlewareContext, status: u16) {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            let _guard = span.enter();
            if let Err(e) = mw.on_response(context, status).await {
                debug!(error = %e, "Middleware on_response failed");
            }
        }
    }

    pub async fn on_error(&self, context: &MiddlewareContext, error: &str) {
        for mw in &self.middleware {
            if let Err(e) = mw.on_error(context, error).await {
                debug!(middleware = mw.name(), error = %e, "Middleware on_error failed");
            }
        }
    }
}

/// Logs every request and its outcome at debug level
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        debug!(
            listener = %context.listener,
            method = %context.method,
            authority = %context.authority,
            path = %context.path,
            remote = %context.remote_address,
            "Request received"
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        debug!(
            method = %context.method,
            path = %context.path,
            status = status,
            route = %context.get_metadata("route").unwrap_or_default(),
            cluster = %context.get_metadata("cluster").unwrap_or_default(),
            duration_ms = context.elapsed().as_millis() as u64,
            "Request completed"
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        debug!(method = %context.method, path = %context.path, error = %error, "Request failed");
        Ok(())
    }
}
