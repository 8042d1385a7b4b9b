use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CORS policy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    /// Exact origins (use "*" for all)
    #[serde(default)]
    pub allow_origin: Vec<String>,

    /// Origins matching any of these regular expressions
    #[serde(default)]
    pub allow_origin_regex: Vec<String>,

    #[serde(default)]
    pub allow_methods: Vec<String>,

    #[serde(default)]
    pub allow_headers: Vec<String>,

    #[serde(default)]
    pub expose_headers: Vec<String>,

    /// Max age for preflight caching (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u32>,

    #[serde(default)]
    pub allow_credentials: bool,

    /// Route-level switch that turns CORS off for one route of a CORS-enabled host
    #[serde(default)]
    pub disable_for_route: bool,
}
