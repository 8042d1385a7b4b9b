use super::ssl::UpstreamSslConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Prioritized fallback localities of an upstream
///
/// The upstream's own hosts are priority 0; the n-th entry of
/// `prioritized_localities` becomes priority n+1.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Failover {
    #[serde(default)]
    pub prioritized_localities: Vec<PriorityLocalities>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PriorityLocalities {
    #[serde(default)]
    pub locality_endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalityLbEndpoints {
    #[serde(default)]
    pub locality: Locality,

    #[serde(default)]
    pub lb_endpoints: Vec<LbEndpoint>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Locality {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub sub_zone: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LbEndpoint {
    pub address: String,
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,

    /// Path used by HTTP health checks against this endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_ssl_config: Option<UpstreamSslConfig>,
}
