use crate::v1::core::ResourceRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tracing for every request on an HTTP listener
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTracing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<TracingProvider>,

    /// Request headers copied into span tags
    #[serde(default)]
    pub request_headers_for_tags: Vec<String>,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default = "default_sampling")]
    pub random_sampling_percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum TracingProvider {
    Zipkin(ZipkinConfig),
    OpenTelemetry(CollectorConfig),
    Datadog(CollectorConfig),
}

impl TracingProvider {
    pub fn collector_upstream(&self) -> &ResourceRef {
        match self {
            TracingProvider::Zipkin(z) => &z.collector_upstream_ref,
            TracingProvider::OpenTelemetry(c) | TracingProvider::Datadog(c) => {
                &c.collector_upstream_ref
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZipkinConfig {
    pub collector_upstream_ref: ResourceRef,

    #[serde(default = "default_zipkin_endpoint")]
    pub collector_endpoint: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    pub collector_upstream_ref: ResourceRef,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

/// Per-route tracing overrides
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteTracing {
    /// Span name for requests on this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_descriptor: Option<String>,

    /// Propagate trace context to the upstream
    #[serde(default = "default_propagate")]
    pub propagate: bool,
}

impl Default for RouteTracing {
    fn default() -> Self {
        Self {
            route_descriptor: None,
            propagate: true,
        }
    }
}

fn default_sampling() -> f64 {
    100.0
}

fn default_zipkin_endpoint() -> String {
    "/api/v2/spans".to_string()
}

fn default_propagate() -> bool {
    true
}
