//! Data plane for the edge gateway
//!
//! Serves the listeners, routes and clusters of a discovery snapshot:
//! HTTP and TCP proxying, TLS termination and origination, health checks
//! with priority failover, gRPC-Web and gRPC-JSON transcoding, and the
//! per-route auth, CORS, DLP, rate-limit and tracing filters.

pub mod access_log;
pub mod cluster;
pub mod cors;
pub mod dlp;
pub mod error;
pub mod ext_auth;
pub mod failover;
pub mod forwarder;
pub mod grpc;
pub mod health_check;
pub mod http;
pub mod listener;
pub mod load_balancer;
pub mod metrics;
pub mod middleware;
pub mod proxy_protocol;
pub mod rate_limit;
pub mod router;
pub mod tcp;
pub mod tls;
pub mod tracing;
pub mod transcoder;

pub use access_log::{AccessLogEntry, AccessLogger};
pub use cluster::{ClusterManager, Host, UpstreamCluster};
pub use error::{ProxyError, Result};
pub use http::HttpProxy;
pub use listener::{serve, ListenerState, SharedRuntime};
pub use load_balancer::LoadBalancer;
pub use metrics::{MetricSample, MetricsCollector, MetricsStreamer};
