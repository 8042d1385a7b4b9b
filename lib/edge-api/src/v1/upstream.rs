use super::core::{HasStatus, Status};
use super::options::{
    Failover, GrpcJsonTranscoder, HealthCheck, LoadBalancerConfig, OutlierDetection,
    UpstreamSslConfig,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upstream is a backend the data plane can route to
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.edge.dev",
    version = "v1",
    kind = "Upstream",
    plural = "upstreams",
    namespaced,
    derive = "Default",
    status = "Status",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    #[serde(default)]
    pub static_hosts: Vec<Host>,

    /// Endpoints discovered from a Kubernetes service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_service: Option<KubeServiceRef>,

    /// Originate TLS even without an explicit ssl config
    #[serde(default)]
    pub use_tls: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_config: Option<UpstreamSslConfig>,

    #[serde(default)]
    pub health_checks: Vec<HealthCheck>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlier_detection: Option<OutlierDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<Failover>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer_config: Option<LoadBalancerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_config: Option<ConnectionConfig>,

    /// Tunnel requests through the hosts as HTTP CONNECT proxies for this authority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy_hostname: Option<String>,

    /// Extra headers sent on the CONNECT request
    #[serde(default)]
    pub http_connect_headers: BTreeMap<String, String>,

    #[serde(default)]
    pub use_http2: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_json_transcoder: Option<GrpcJsonTranscoder>,
}

impl HasStatus for Upstream {
    fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: Status) {
        self.status = Some(status);
    }
}

/// Statically configured host
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    /// IP address or DNS name
    pub addr: String,

    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,

    /// Path used by HTTP health checks against this host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,
}

impl Host {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            ..Default::default()
        }
    }

    pub fn is_ip(&self) -> bool {
        self.addr.parse::<std::net::IpAddr>().is_ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeServiceRef {
    pub name: String,

    /// Defaults to the upstream's namespace
    #[serde(default)]
    pub namespace: String,

    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_connection: Option<u32>,

    /// Connect timeout (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}
