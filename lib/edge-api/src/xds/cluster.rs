use crate::v1::options::{
    GrpcJsonTranscoder, HealthCheck, LoadBalancerConfig, Locality, OutlierDetection,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upstream cluster as seen by the data plane
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,

    pub kind: ClusterKind,

    #[serde(default)]
    pub lb: LoadBalancerConfig,

    #[serde(default)]
    pub health_checks: Vec<HealthCheck>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlier_detection: Option<OutlierDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<UpstreamTls>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_connect_tunnel: Option<HttpConnectTunnel>,

    #[serde(default)]
    pub http2: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_json_transcoder: Option<GrpcJsonTranscoder>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterKind {
    /// Hosts are IP addresses listed in the assignment
    #[default]
    Static,
    /// Hosts are DNS names resolved by the data plane
    StrictDns,
    /// Hosts come from the endpoint assignment, possibly across priorities
    Eds,
    /// Hosts are taken from the request authority
    DynamicForwardProxy,
}

/// TLS origination material resolved from a secret
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    #[serde(default)]
    pub cert_chain: String,

    #[serde(default)]
    pub private_key: String,

    #[serde(default)]
    pub root_ca: String,

    #[serde(default)]
    pub alpn_protocols: Vec<String>,
}

/// Requests are sent through the cluster hosts as HTTP CONNECT proxies
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConnectTunnel {
    pub hostname: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Endpoints of one cluster grouped by locality and priority
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,

    #[serde(default)]
    pub endpoints: Vec<LocalityLbEndpoints>,
}

impl ClusterLoadAssignment {
    /// Highest priority number present
    pub fn max_priority(&self) -> u32 {
        self.endpoints.iter().map(|e| e.priority).max().unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalityLbEndpoints {
    #[serde(default)]
    pub locality: Locality,

    /// 0 is the most preferred
    #[serde(default)]
    pub priority: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,

    #[serde(default)]
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LbEndpoint {
    pub address: String,

    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,

    /// Overrides the cluster TLS for this endpoint only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<UpstreamTls>,
}

impl LbEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            weight: default_weight(),
            health_check_path: None,
            tls: None,
        }
    }

    /// `address:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

fn default_weight() -> u32 {
    1
}
