//! Request authentication
//!
//! Auth configs on a virtual host or route are compiled into the route's
//! [`AuthPolicy`] with every secret resolved, so the data plane never reads
//! secrets itself. A config that cannot be compiled is a route error.

use super::{HttpConnectionManagerPlugin, Params};
use crate::{Result, TranslateError};
use edge_api::v1::options::ext_auth::{AccessTokenValidation, ApiKeyAuth, DEFAULT_API_KEY_HEADER};
use edge_api::v1::options::{AuthConfig, ExtAuth, RouteOptions, VirtualHostOptions};
use edge_api::v1::proxy::HttpListener;
use edge_api::xds::{
    ApiKeyCheck, ApiKeyIdentity, AuthCheck, AuthPolicy, BasicCheck, FilterStage, HttpConnectionManager,
    HttpFilter, IntrospectionCheck,
};
use edge_api::{ResourceRef, Secret};
use edge_core::ApiSnapshot;
use kube::ResourceExt;
use std::collections::BTreeMap;

pub const EXT_AUTH_FILTER: &str = "ext_authz";
/// Entry of a `Header` secret holding the API key
pub const API_KEY_ENTRY: &str = "api-key";

fn enabled(ext_auth: Option<&ExtAuth>) -> Option<&ExtAuth> {
    ext_auth.filter(|a| !a.disable && !a.configs.is_empty())
}

/// The route's auth, the virtual host's when the route sets none
pub fn route_auth(
    snapshot: &ApiSnapshot,
    virtual_host: &VirtualHostOptions,
    route: &RouteOptions,
    namespace: &str,
) -> Result<Option<AuthPolicy>> {
    let Some(ext_auth) = enabled(route.ext_auth.as_ref().or(virtual_host.ext_auth.as_ref())) else {
        return Ok(None);
    };
    let checks = ext_auth
        .configs
        .iter()
        .map(|config| compile(snapshot, config, namespace))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(AuthPolicy { checks }))
}

fn compile(snapshot: &ApiSnapshot, config: &AuthConfig, namespace: &str) -> Result<AuthCheck> {
    match config {
        AuthConfig::BasicAuth(basic) => {
            if basic.users.is_empty() {
                return Err(TranslateError::InvalidConfiguration("basic auth has no users".into()));
            }
            Ok(AuthCheck::Basic(BasicCheck {
                realm: basic.realm.clone(),
                users: basic.users.clone(),
            }))
        }
        AuthConfig::ApiKeyAuth(api_key) => api_key_check(snapshot, api_key, namespace).map(AuthCheck::ApiKey),
        AuthConfig::AccessTokenValidation(validation) => {
            introspection_check(snapshot, validation, namespace).map(AuthCheck::Introspection)
        }
    }
}

fn find_secret<'a>(snapshot: &'a ApiSnapshot, secret_ref: &ResourceRef, namespace: &str) -> Result<&'a Secret> {
    let secret_ref = secret_ref.in_namespace(namespace);
    snapshot
        .secret(&secret_ref)
        .ok_or(TranslateError::SecretNotFound(secret_ref))
}

fn api_key_check(snapshot: &ApiSnapshot, config: &ApiKeyAuth, namespace: &str) -> Result<ApiKeyCheck> {
    let mut secrets = config
        .api_key_secret_refs
        .iter()
        .map(|r| find_secret(snapshot, r, namespace))
        .collect::<Result<Vec<_>>>()?;

    if !config.label_selector.is_empty() {
        let before = secrets.len();
        secrets.extend(snapshot.secrets.iter().filter(|secret| {
            let labels = secret.labels();
            config
                .label_selector
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
        }));
        if secrets.len() == before {
            return Err(TranslateError::InvalidConfiguration(format!(
                "no API key secrets match labels {:?}",
                config.label_selector
            )));
        }
    }
    if secrets.is_empty() {
        return Err(TranslateError::InvalidConfiguration("API key auth selects no secrets".into()));
    }

    let mut keys = BTreeMap::new();
    for secret in secrets {
        let reference = ResourceRef::of(secret);
        let header = secret.spec.kind.as_header().ok_or_else(|| {
            TranslateError::InvalidConfiguration(format!("secret {} is not an API key secret", reference))
        })?;
        let mut metadata = header.headers.clone();
        let key = metadata
            .remove(API_KEY_ENTRY)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                TranslateError::InvalidConfiguration(format!("no API key found on secret {}", reference))
            })?;
        for entry in config.headers_from_metadata.values().filter(|e| e.required) {
            if !metadata.contains_key(&entry.name) {
                return Err(TranslateError::InvalidConfiguration(format!(
                    "API key secret {} does not contain the required {} metadata entry",
                    reference, entry.name
                )));
            }
        }
        keys.insert(
            key,
            ApiKeyIdentity {
                user: secret.name_any(),
                metadata,
            },
        );
    }

    Ok(ApiKeyCheck {
        header_name: config
            .header_name
            .clone()
            .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
        keys,
        headers_from_metadata: config
            .headers_from_metadata
            .iter()
            .map(|(header, entry)| (header.clone(), entry.name.clone()))
            .collect(),
    })
}

fn introspection_check(
    snapshot: &ApiSnapshot,
    config: &AccessTokenValidation,
    namespace: &str,
) -> Result<IntrospectionCheck> {
    if !(config.introspection_url.starts_with("http://") || config.introspection_url.starts_with("https://")) {
        return Err(TranslateError::InvalidConfiguration(format!(
            "introspection url {:?} is not an http(s) url",
            config.introspection_url
        )));
    }
    let client_secret = match &config.client_secret_ref {
        Some(secret_ref) => {
            let secret = find_secret(snapshot, secret_ref, namespace)?;
            secret
                .spec
                .kind
                .as_oauth()
                .map(|o| o.client_secret.clone())
                .ok_or_else(|| {
                    TranslateError::InvalidConfiguration(format!(
                        "secret {} is not an OAuth secret",
                        ResourceRef::of(secret)
                    ))
                })?
        }
        None => String::new(),
    };
    Ok(IntrospectionCheck {
        url: config.introspection_url.clone(),
        client_id: config.client_id.clone(),
        client_secret,
        user_id_attribute_name: config.user_id_attribute_name.clone(),
    })
}

/// Installs the auth filter when any virtual host or route enables auth
pub struct ExtAuthPlugin;

impl HttpConnectionManagerPlugin for ExtAuthPlugin {
    fn name(&self) -> &'static str {
        EXT_AUTH_FILTER
    }

    fn process_hcm(&self, _params: &Params<'_>, http: &HttpListener, hcm: &mut HttpConnectionManager) -> Result<()> {
        let any = http.virtual_hosts.iter().any(|vh| {
            enabled(vh.options.ext_auth.as_ref()).is_some()
                || vh.routes.iter().any(|r| enabled(r.options.ext_auth.as_ref()).is_some())
        });
        if any && !hcm.has_filter(EXT_AUTH_FILTER) {
            hcm.http_filters.push(HttpFilter {
                name: EXT_AUTH_FILTER.to_string(),
                stage: FilterStage::AuthN,
            });
        }
        Ok(())
    }
}
