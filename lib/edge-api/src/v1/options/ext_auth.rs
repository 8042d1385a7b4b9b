use crate::v1::core::ResourceRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_API_KEY_HEADER: &str = "api-key";

/// Request authentication for a virtual host or route.
///
/// Every config must accept the request. A route's `ExtAuth` replaces its
/// virtual host's; `disable` turns inherited auth off for the route.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtAuth {
    #[serde(default)]
    pub disable: bool,

    #[serde(default)]
    pub configs: Vec<AuthConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum AuthConfig {
    BasicAuth(BasicAuth),
    ApiKeyAuth(ApiKeyAuth),
    AccessTokenValidation(AccessTokenValidation),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    #[serde(default)]
    pub realm: String,

    /// Keyed by user name
    #[serde(default)]
    pub users: BTreeMap<String, SaltedHashedPassword>,
}

/// `hashed_password` is hex SHA-256 of `salt` followed by the password
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaltedHashedPassword {
    pub salt: String,
    pub hashed_password: String,
}

/// API keys come from `Header` secrets: the `api-key` entry is the key and
/// the remaining entries are its metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyAuth {
    /// Defaults to `api-key`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,

    #[serde(default)]
    pub api_key_secret_refs: Vec<ResourceRef>,

    /// Secrets whose labels contain all of these
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,

    /// Upstream request header to key metadata entry
    #[serde(default)]
    pub headers_from_metadata: BTreeMap<String, MetadataEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEntry {
    pub name: String,

    /// Every selected secret must carry this entry
    #[serde(default)]
    pub required: bool,
}

/// OAuth2 bearer tokens checked against an RFC 7662 introspection endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenValidation {
    pub introspection_url: String,

    #[serde(default)]
    pub client_id: String,

    /// `Oauth` secret holding the client secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<ResourceRef>,

    /// Introspection claim forwarded as the user id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id_attribute_name: Option<String>,
}
