use crate::Result;
use async_trait::async_trait;
use edge_api::{ResourceRef, Secret};

/// Order in which a [`crate::MultiSecretSource`] consults its sources
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Kubernetes,
    Memory,
    Vault,
}

/// Read access to secrets from one backend
#[async_trait]
pub trait SecretSource: Send + Sync {
    fn name(&self) -> &str;

    fn precedence(&self) -> Precedence;

    async fn read(&self, secret: &ResourceRef) -> Result<Secret>;

    /// All secrets in `namespace`, or every namespace for `None`
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Secret>>;
}
