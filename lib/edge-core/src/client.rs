//! Resource client abstraction
//!
//! Every resource kind is read and written through a [`ResourceClient`].
//! Clients are namespace scoped: reads, writes and deletes name a namespace,
//! lists take an optional namespace where `None` means all namespaces.

use crate::Result;
use async_trait::async_trait;
use edge_api::{HasStatus, Status};
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Bounds shared by every resource a client can store
pub trait ClientResource:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> ClientResource for T where
    T: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOpts {
    /// Replace an existing resource that was written without a resource version
    pub overwrite_existing: bool,
}

impl WriteOpts {
    pub fn overwrite() -> Self {
        Self {
            overwrite_existing: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOpts {
    pub ignore_not_exist: bool,
}

/// CRUD access to one resource kind
#[async_trait]
pub trait ResourceClient<K: ClientResource>: Send + Sync {
    /// Kind name used in errors and logs
    fn kind(&self) -> &str;

    async fn read(&self, namespace: &str, name: &str) -> Result<K>;

    /// Create or replace a resource, returning the stored copy
    ///
    /// A resource version on `resource` must match the stored one. Without a
    /// resource version an existing resource is only replaced when
    /// `opts.overwrite_existing` is set.
    async fn write(&self, resource: K, opts: WriteOpts) -> Result<K>;

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> Result<()>;

    /// Sorted by namespace then name
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    /// Yields once per observed change to any resource of this kind
    fn subscribe(&self) -> BoxStream<'static, ()>;
}

/// Clients for kinds that carry a status subresource
#[async_trait]
pub trait StatusClient<K: ClientResource + HasStatus>: ResourceClient<K> {
    /// Replace only the status; spec and generation are untouched
    async fn apply_status(&self, namespace: &str, name: &str, status: Status) -> Result<K>;
}

/// List across a set of namespaces; empty means all namespaces
pub async fn list_namespaces<K, C>(client: &C, namespaces: &[String]) -> Result<Vec<K>>
where
    K: ClientResource,
    C: ResourceClient<K> + ?Sized,
{
    if namespaces.is_empty() || namespaces.iter().any(|ns| ns == "*") {
        return client.list(None).await;
    }
    let mut all = Vec::new();
    for ns in namespaces {
        all.extend(client.list(Some(ns)).await?);
    }
    Ok(all)
}
