//! Control-plane settings
//!
//! Settings are read from the YAML file named by `EDGE_SETTINGS_PATH` when
//! set, then individual fields are overridden from the environment.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const SETTINGS_PATH: &str = "EDGE_SETTINGS_PATH";
const WRITE_NAMESPACE: &str = "EDGE_WRITE_NAMESPACE";
const DISCOVERY_NAMESPACE: &str = "EDGE_DISCOVERY_NAMESPACE";
const WATCH_NAMESPACES: &str = "EDGE_WATCH_NAMESPACES";
const XDS_ADDR: &str = "EDGE_XDS_ADDR";
const REFRESH_RATE_MS: &str = "EDGE_REFRESH_RATE_MS";
const RESOURCE_DIR: &str = "EDGE_RESOURCE_DIR";
const VAULT_ADDR: &str = "EDGE_VAULT_ADDR";
const VAULT_TOKEN: &str = "EDGE_VAULT_TOKEN";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Namespace discovery writes into
    pub discovery_namespace: String,

    /// Namespace generated proxies are written to; only gateways here are read
    /// unless `gateway.read_gateways_from_all_namespaces` is set
    pub write_namespace: String,

    /// Namespaces to watch; empty watches all
    pub watch_namespaces: Vec<String>,

    pub resource_source: ResourceSource,

    /// Consulted in precedence order, see `edge_secrets::MultiSecretSource`
    pub secret_sources: Vec<SecretSourceSettings>,

    /// Address the discovery server listens on
    pub xds_bind_addr: String,

    /// Minimum interval between two syncs
    pub refresh_rate_ms: u64,

    pub gateway: GatewaySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_namespace: "edge-system".to_string(),
            write_namespace: "edge-system".to_string(),
            watch_namespaces: Vec::new(),
            resource_source: ResourceSource::Kubernetes,
            secret_sources: vec![SecretSourceSettings::Kubernetes],
            xds_bind_addr: "0.0.0.0:9977".to_string(),
            refresh_rate_ms: 1000,
            gateway: GatewaySettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceSource {
    Kubernetes,
    /// YAML manifests loaded into in-memory clients
    Directory { path: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretSourceSettings {
    Kubernetes,
    Memory,
    Vault(VaultSettings),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultSettings {
    pub address: String,
    pub token: String,
    /// KV v2 mount
    pub path_prefix: String,
    /// Directory under the mount holding gateway secrets
    pub root_key: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            token: String::new(),
            path_prefix: "secret".to_string(),
            root_key: "gateway".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    pub read_gateways_from_all_namespaces: bool,

    /// Replace routes with errors by a direct response instead of rejecting the proxy
    pub replace_invalid_routes: bool,

    pub invalid_route_response_code: u16,

    pub default_proxy_name: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            read_gateways_from_all_namespaces: false,
            replace_invalid_routes: false,
            invalid_route_response_code: 404,
            default_proxy_name: edge_api::v1::DEFAULT_PROXY_NAME.to_string(),
        }
    }
}

impl Settings {
    /// Load from `EDGE_SETTINGS_PATH` (if set) and apply env overrides
    pub fn load() -> Result<Self> {
        let mut settings = match parse::<String>(SETTINGS_PATH)? {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    /// Enum variants are written as single-key maps, e.g. `directory: {path: ...}`
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let de = serde_yaml::Deserializer::from_str(raw);
        Ok(serde_yaml::with::singleton_map_recursive::deserialize(de)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        self.write_namespace = parse_default(WRITE_NAMESPACE, self.write_namespace.clone())?;
        self.discovery_namespace =
            parse_default(DISCOVERY_NAMESPACE, self.discovery_namespace.clone())?;
        if let Some(namespaces) = parse::<String>(WATCH_NAMESPACES)? {
            self.watch_namespaces = namespaces
                .split(',')
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect();
        }
        self.xds_bind_addr = parse_default(XDS_ADDR, self.xds_bind_addr.clone())?;
        self.refresh_rate_ms = parse_default(REFRESH_RATE_MS, self.refresh_rate_ms)?;
        if let Some(path) = parse::<String>(RESOURCE_DIR)? {
            self.resource_source = ResourceSource::Directory { path };
        }

        let vault_addr = parse::<String>(VAULT_ADDR)?;
        let vault_token = parse::<String>(VAULT_TOKEN)?;
        if vault_addr.is_some() || vault_token.is_some() {
            let has_vault = self
                .secret_sources
                .iter()
                .any(|s| matches!(s, SecretSourceSettings::Vault(_)));
            if !has_vault {
                self.secret_sources
                    .push(SecretSourceSettings::Vault(VaultSettings::default()));
            }
            for source in self.secret_sources.iter_mut() {
                if let SecretSourceSettings::Vault(vault) = source {
                    if let Some(addr) = &vault_addr {
                        vault.address = addr.clone();
                    }
                    if let Some(token) = &vault_token {
                        vault.token = token.clone();
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn refresh_rate(&self) -> Duration {
        Duration::from_millis(self.refresh_rate_ms)
    }
}

/// Read and parse an env var, `None` when unset
pub fn parse<T: FromStr>(env: &str) -> Result<Option<T>> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|_| CoreError::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

pub fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T> {
    parse(env).map(|v| v.unwrap_or(default))
}
