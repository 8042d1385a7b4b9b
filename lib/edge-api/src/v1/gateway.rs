use super::core::{HasStatus, ResourceRef, Status};
use super::options::{HttpListenerOptions, ListenerOptions};
use super::proxy::{HybridMatcher, TcpHost};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Gateway declares one listener of a proxy and which virtual services it serves
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.edge.dev",
    version = "v1",
    kind = "Gateway",
    plural = "gateways",
    namespaced,
    derive = "Default",
    status = "Status",
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.bindPort"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    pub bind_port: u16,

    /// Serve only virtual services that carry an SSL config
    #[serde(default)]
    pub ssl: bool,

    /// Proxies this gateway is rendered into; defaults to the configured proxy name
    #[serde(default)]
    pub proxy_names: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_proxy_proto: Option<bool>,

    #[serde(default)]
    pub options: ListenerOptions,

    #[serde(default)]
    pub gateway_type: GatewayType,
}

impl HasStatus for Gateway {
    fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: Status) {
        self.status = Some(status);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum GatewayType {
    Http(HttpGateway),
    Tcp(TcpGateway),
    Hybrid(HybridGateway),
}

impl Default for GatewayType {
    fn default() -> Self {
        GatewayType::Http(HttpGateway::default())
    }
}

/// Virtual service selection for an HTTP gateway
///
/// Explicit refs win over the selector; with neither, every virtual service
/// in `virtual_service_namespaces` is selected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpGateway {
    #[serde(default)]
    pub virtual_services: Vec<ResourceRef>,

    #[serde(default)]
    pub virtual_service_selector: BTreeMap<String, String>,

    /// Empty or "*" selects all namespaces
    #[serde(default)]
    pub virtual_service_namespaces: Vec<String>,

    #[serde(default)]
    pub options: HttpListenerOptions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TcpGateway {
    #[serde(default)]
    pub tcp_hosts: Vec<TcpHost>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HybridGateway {
    #[serde(default)]
    pub matched_gateways: Vec<MatchedGateway>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchedGateway {
    #[serde(default)]
    pub matcher: HybridMatcher,

    pub gateway: MatchedGatewayType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum MatchedGatewayType {
    Http(HttpGateway),
    Tcp(TcpGateway),
}

fn default_bind_address() -> String {
    "::".to_string()
}
