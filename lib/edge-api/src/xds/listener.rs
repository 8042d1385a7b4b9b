use crate::v1::options::{AccessLog, DlpRules, ListenerTracing};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,

    pub address: String,

    pub port: u16,

    /// Run before any filter chain is selected, e.g. `proxy_protocol`
    #[serde(default)]
    pub listener_filters: Vec<String>,

    /// Allow connections without a PROXY header when `proxy_protocol` is set
    #[serde(default)]
    pub proxy_protocol_optional: bool,

    #[serde(default)]
    pub filter_chains: Vec<FilterChain>,

    #[serde(default)]
    pub access_logs: Vec<AccessLog>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_connection_buffer_limit_bytes: Option<u32>,
}

impl Listener {
    pub fn has_listener_filter(&self, name: &str) -> bool {
        self.listener_filters.iter().any(|f| f == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterChain {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub filter_chain_match: FilterChainMatch,

    /// Terminate TLS with this material
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<DownstreamTls>,

    pub filter: NetworkFilter,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterChainMatch {
    /// CIDR ranges of the downstream source address; empty matches all
    #[serde(default)]
    pub source_prefix_ranges: Vec<String>,

    /// SNI names; empty matches all
    #[serde(default)]
    pub server_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamTls {
    pub cert_chain: String,
    pub private_key: String,
    #[serde(default)]
    pub root_ca: String,
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkFilter {
    HttpConnectionManager(HttpConnectionManager),
    TcpProxy(TcpProxy),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConnectionManager {
    pub route_config_name: String,

    /// Ordered by stage, `router` always last
    #[serde(default)]
    pub http_filters: Vec<HttpFilter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<ListenerTracing>,

    /// Fallback DLP evaluated when a route carries none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener_dlp: Option<DlpRules>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl Default for NetworkFilter {
    fn default() -> Self {
        Self::HttpConnectionManager(HttpConnectionManager::default())
    }
}

impl HttpConnectionManager {
    pub fn has_filter(&self, name: &str) -> bool {
        self.http_filters.iter().any(|f| f.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpFilter {
    pub name: String,
    pub stage: FilterStage,
}

/// Coarse ordering of HTTP filters
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterStage {
    Fault,
    Cors,
    WafStage,
    AuthN,
    RateLimit,
    Accepted,
    OutAuth,
    Route,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpProxy {
    pub stat_prefix: String,
    pub cluster: String,
}
