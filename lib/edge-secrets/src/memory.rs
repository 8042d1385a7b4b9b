use crate::{Precedence, Result, SecretSource};
use async_trait::async_trait;
use edge_api::{ResourceRef, Secret};
use edge_core::{MemoryResourceClient, ResourceClient};

/// Secrets held by an in-memory resource client
#[derive(Clone, Default)]
pub struct MemorySecretSource {
    client: MemoryResourceClient<Secret>,
}

impl MemorySecretSource {
    pub fn new(client: MemoryResourceClient<Secret>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &MemoryResourceClient<Secret> {
        &self.client
    }
}

#[async_trait]
impl SecretSource for MemorySecretSource {
    fn name(&self) -> &str {
        "memory"
    }

    fn precedence(&self) -> Precedence {
        Precedence::Memory
    }

    async fn read(&self, secret: &ResourceRef) -> Result<Secret> {
        Ok(self.client.read(&secret.namespace, &secret.name).await?)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Secret>> {
        Ok(self.client.list(namespace).await?)
    }
}
