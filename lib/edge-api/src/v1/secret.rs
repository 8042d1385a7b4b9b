use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Secret holds credential material referenced by upstreams and listeners
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.edge.dev",
    version = "v1",
    kind = "Secret",
    plural = "secrets",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    pub kind: SecretKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SecretKind {
    Tls(TlsSecret),
    Oauth(OauthSecret),
    Header(HeaderSecret),
    Generic(GenericSecret),
}

impl Default for SecretKind {
    fn default() -> Self {
        SecretKind::Generic(GenericSecret::default())
    }
}

impl SecretKind {
    pub fn as_tls(&self) -> Option<&TlsSecret> {
        match self {
            SecretKind::Tls(tls) => Some(tls),
            _ => None,
        }
    }

    pub fn as_oauth(&self) -> Option<&OauthSecret> {
        match self {
            SecretKind::Oauth(oauth) => Some(oauth),
            _ => None,
        }
    }

    pub fn as_header(&self) -> Option<&HeaderSecret> {
        match self {
            SecretKind::Header(header) => Some(header),
            _ => None,
        }
    }
}

/// PEM-encoded certificate chain, key and optional CA bundle
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecret {
    pub cert_chain: String,
    pub private_key: String,
    #[serde(default)]
    pub root_ca: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OauthSecret {
    pub client_secret: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSecret {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenericSecret {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn tls(namespace: &str, name: &str, tls: TlsSecret) -> Self {
        let mut secret = Secret::new(name, SecretSpec { kind: SecretKind::Tls(tls) });
        secret.metadata.namespace = Some(namespace.to_string());
        secret
    }
}
