use super::core::{HasStatus, Status};
use super::options::{SslConfig, VirtualHostOptions};
use super::proxy::Route;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VirtualService describes the domains and routes of one virtual host
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.edge.dev",
    version = "v1",
    kind = "VirtualService",
    plural = "virtualservices",
    namespaced,
    derive = "Default",
    status = "Status",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_host: Option<VirtualServiceHost>,

    /// Serve this virtual service on SSL gateways with these certificates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_config: Option<SslConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl HasStatus for VirtualService {
    fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: Status) {
        self.status = Some(status);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceHost {
    /// Empty is treated as "*"
    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub options: VirtualHostOptions,
}
