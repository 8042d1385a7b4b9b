use crate::v1::core::ResourceRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Downstream TLS termination
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SslConfig {
    /// TLS secret holding the certificate chain and key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ResourceRef>,

    /// SNI names this certificate serves; empty serves any
    #[serde(default)]
    pub sni_domains: Vec<String>,

    #[serde(default)]
    pub alpn_protocols: Vec<String>,
}

/// TLS origination towards an upstream
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSslConfig {
    /// Client certificate and trusted CA
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ResourceRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    #[serde(default)]
    pub alpn_protocols: Vec<String>,
}
