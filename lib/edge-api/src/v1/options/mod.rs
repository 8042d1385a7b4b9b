//! Plugin options attachable at listener, virtual host and route scope

pub mod access_log;
pub mod cors;
pub mod dlp;
pub mod ext_auth;
pub mod failover;
pub mod grpc;
pub mod health_check;
pub mod load_balancer;
pub mod rate_limit;
pub mod ssl;
pub mod tracing;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use access_log::{AccessLog, AccessLogOutput, AccessLoggingService, FileFormat};
pub use cors::CorsPolicy;
pub use dlp::{DlpAction, DlpActionType, DlpConfig, DlpRule, DlpRules, EnabledFor};
pub use ext_auth::{AccessTokenValidation, ApiKeyAuth, AuthConfig, BasicAuth, ExtAuth, SaltedHashedPassword};
pub use failover::{Failover, LbEndpoint, Locality, LocalityLbEndpoints, PriorityLocalities};
pub use grpc::{GrpcJsonTranscoder, GrpcWeb};
pub use health_check::{HealthCheck, HealthCheckKind, OutlierDetection};
pub use load_balancer::{LoadBalancerConfig, LoadBalancerPolicy};
pub use rate_limit::{RateLimitPolicy, RateLimitRule};
pub use ssl::{SslConfig, UpstreamSslConfig};
pub use tracing::{ListenerTracing, RouteTracing, TracingProvider};

/// Options applied to a whole listener regardless of its type
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListenerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_logging_service: Option<AccessLoggingService>,

    /// Expect a PROXY protocol header on every downstream connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_protocol: Option<ProxyProtocol>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_connection_buffer_limit_bytes: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyProtocol {
    /// Accept connections that do not start with a PROXY header
    #[serde(default)]
    pub allow_requests_without_proxy_protocol: bool,
}

/// Options for the HTTP connection manager of one listener
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpListenerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<ListenerTracing>,

    /// Listener-wide DLP rules, used when neither route nor virtual host sets DLP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlp: Option<DlpRules>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_web: Option<GrpcWeb>,

    /// Value of the `server` response header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHostOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_auth: Option<ExtAuth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlp: Option<DlpConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<RouteTracing>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_auth: Option<ExtAuth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlp: Option<DlpConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<RouteTracing>,

    /// Request timeout (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_rewrite: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_rewrite: Option<String>,
}

/// Retry policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Retry on these HTTP status codes
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<u16>,

    /// Initial backoff duration (ms)
    #[serde(default = "default_initial_backoff")]
    pub base_interval_ms: u64,

    /// Maximum backoff duration (ms)
    #[serde(default = "default_max_backoff")]
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_on_status: default_retry_on_status(),
            base_interval_ms: default_initial_backoff(),
            max_interval_ms: default_max_backoff(),
        }
    }
}

fn default_retry_on_status() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_initial_backoff() -> u64 {
    25
}

fn default_max_backoff() -> u64 {
    250
}
