use crate::{
    KubernetesSecretSource, MemorySecretSource, Precedence, Result, SecretError, SecretSource,
    VaultSecretSource,
};
use async_trait::async_trait;
use edge_api::{ResourceRef, Secret};
use edge_core::settings::SecretSourceSettings;
use edge_core::MemoryResourceClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Secret sources consulted in precedence order
///
/// `read` returns the first source that has the secret. `list` merges all
/// sources; on duplicate refs the higher-precedence source wins. A failing
/// source fails the whole list so callers keep their last good view.
#[derive(Clone, Default)]
pub struct MultiSecretSource {
    sources: Vec<Arc<dyn SecretSource>>,
}

impl MultiSecretSource {
    pub fn new(mut sources: Vec<Arc<dyn SecretSource>>) -> Self {
        // Stable, so sources of equal precedence keep their configured order
        sources.sort_by_key(|s| s.precedence());
        Self { sources }
    }

    /// Build the configured sources
    ///
    /// The in-memory source shares `memory` so secrets loaded elsewhere
    /// (e.g. from manifests) are visible.
    pub fn from_settings(
        settings: &[SecretSourceSettings],
        kube: Option<&kube::Client>,
        memory: &MemoryResourceClient<Secret>,
    ) -> Result<Self> {
        let mut sources: Vec<Arc<dyn SecretSource>> = Vec::new();
        for source in settings {
            match source {
                SecretSourceSettings::Kubernetes => {
                    let client = kube.ok_or_else(|| {
                        SecretError::Config("kubernetes secret source needs a kube client".into())
                    })?;
                    sources.push(Arc::new(KubernetesSecretSource::new(client.clone())));
                }
                SecretSourceSettings::Memory => {
                    sources.push(Arc::new(MemorySecretSource::new(memory.clone())));
                }
                SecretSourceSettings::Vault(vault) => {
                    if vault.token.is_empty() {
                        return Err(SecretError::Config("vault secret source needs a token".into()));
                    }
                    sources.push(Arc::new(VaultSecretSource::new(vault)));
                }
            }
        }
        if sources.is_empty() {
            return Err(SecretError::Config("no secret sources configured".into()));
        }
        Ok(Self::new(sources))
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl SecretSource for MultiSecretSource {
    fn name(&self) -> &str {
        "multi"
    }

    fn precedence(&self) -> Precedence {
        self.sources
            .first()
            .map(|s| s.precedence())
            .unwrap_or(Precedence::Memory)
    }

    async fn read(&self, secret: &ResourceRef) -> Result<Secret> {
        let mut last_err = None;
        for source in &self.sources {
            match source.read(secret).await {
                Ok(found) => return Ok(found),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(source = %source.name(), secret = %secret, error = %e, "Secret source read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SecretError::NotFound(secret.clone())))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Secret>> {
        let mut merged: BTreeMap<ResourceRef, Secret> = BTreeMap::new();
        for source in &self.sources {
            let secrets = source.list(namespace).await.map_err(|e| {
                warn!(source = %source.name(), error = %e, "Secret source list failed");
                e
            })?;
            for secret in secrets {
                merged.entry(ResourceRef::of(&secret)).or_insert(secret);
            }
        }
        Ok(merged.into_values().collect())
    }
}
