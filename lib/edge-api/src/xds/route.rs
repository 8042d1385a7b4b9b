use super::auth::AuthPolicy;
use crate::v1::options::{CorsPolicy, DlpConfig, RateLimitPolicy, RetryPolicy, RouteTracing};
use crate::v1::proxy::{DirectResponseAction, Matcher, RedirectAction};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfiguration {
    pub name: String,

    #[serde(default)]
    pub virtual_hosts: Vec<EnvoyVirtualHost>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyVirtualHost {
    pub name: String,

    pub domains: Vec<String>,

    #[serde(default)]
    pub routes: Vec<EnvoyRoute>,
}

/// One route per matcher of the source route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyRoute {
    pub name: String,

    pub matcher: Matcher,

    pub action: EnvoyAction,

    #[serde(default)]
    pub policies: RoutePolicies,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvoyAction {
    Cluster(String),
    WeightedClusters(Vec<WeightedCluster>),
    Redirect(RedirectAction),
    DirectResponse(DirectResponseAction),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

/// Policies effective on a route after layering route over virtual host over listener
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicies {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_auth: Option<AuthPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlp: Option<DlpConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<RouteTracing>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_rewrite: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_rewrite: Option<String>,
}
