use crate::v1::options::SaltedHashedPassword;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Auth with every secret resolved; all checks must pass
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPolicy {
    #[serde(default)]
    pub checks: Vec<AuthCheck>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthCheck {
    Basic(BasicCheck),
    ApiKey(ApiKeyCheck),
    Introspection(IntrospectionCheck),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicCheck {
    pub realm: String,
    pub users: BTreeMap<String, SaltedHashedPassword>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyCheck {
    pub header_name: String,

    /// Keyed by the API key itself
    pub keys: BTreeMap<String, ApiKeyIdentity>,

    /// Upstream request header to metadata entry
    #[serde(default)]
    pub headers_from_metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyIdentity {
    /// Name of the secret the key came from
    pub user: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionCheck {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id_attribute_name: Option<String>,
}
