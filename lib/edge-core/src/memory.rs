//! In-memory resource client
//!
//! Backs tests and the directory resource source. Resource versions come from
//! a per-client counter and every spec write bumps `metadata.generation`.

use crate::client::{ClientResource, DeleteOpts, ResourceClient, StatusClient, WriteOpts};
use crate::{CoreError, Result};
use async_trait::async_trait;
use edge_api::{HasStatus, Status};
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

type Key = (String, String);

pub struct MemoryResourceClient<K> {
    kind: String,
    store: Arc<RwLock<BTreeMap<Key, K>>>,
    resource_version: Arc<AtomicU64>,
    changes: broadcast::Sender<()>,
}

impl<K: ClientResource> MemoryResourceClient<K> {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            kind: K::kind(&()).to_string(),
            store: Arc::new(RwLock::new(BTreeMap::new())),
            resource_version: Arc::new(AtomicU64::new(0)),
            changes,
        }
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self) {
        // No subscribers is fine
        let _ = self.changes.send(());
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }
}

impl<K: ClientResource> Default for MemoryResourceClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for MemoryResourceClient<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            store: self.store.clone(),
            resource_version: self.resource_version.clone(),
            changes: self.changes.clone(),
        }
    }
}

#[async_trait]
impl<K: ClientResource> ResourceClient<K> for MemoryResourceClient<K> {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<K> {
        let store = self.store.read().await;
        store
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::not_found(&self.kind, namespace, name))
    }

    async fn write(&self, mut resource: K, opts: WriteOpts) -> Result<K> {
        let namespace = resource.namespace().ok_or_else(|| {
            CoreError::InvalidConfiguration(format!(
                "{} {} has no namespace",
                self.kind,
                resource.name_any()
            ))
        })?;
        let name = resource.name_any();
        if name.is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "{} in {} has no name",
                self.kind, namespace
            )));
        }

        let key = (namespace.clone(), name.clone());
        let mut store = self.store.write().await;

        let generation = match store.get(&key) {
            Some(existing) => {
                let found = existing.resource_version().unwrap_or_default();
                match resource.resource_version() {
                    Some(expected) if expected != found => {
                        return Err(CoreError::ResourceVersionConflict {
                            kind: self.kind.clone(),
                            namespace,
                            name,
                            expected,
                            found,
                        });
                    }
                    None if !opts.overwrite_existing => {
                        return Err(CoreError::AlreadyExists {
                            kind: self.kind.clone(),
                            namespace,
                            name,
                        });
                    }
                    _ => {}
                }
                resource.meta_mut().uid = existing.meta().uid.clone();
                resource.meta_mut().creation_timestamp = existing.meta().creation_timestamp.clone();
                existing.meta().generation.unwrap_or(0) + 1
            }
            None => {
                resource.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
                resource.meta_mut().creation_timestamp = Some(Time(chrono::Utc::now()));
                1
            }
        };

        let mut resource = without_status(resource)?;
        let meta = resource.meta_mut();
        meta.generation = Some(generation);
        meta.resource_version = Some(self.next_version());

        store.insert(key, resource.clone());
        drop(store);

        debug!(kind = %self.kind, namespace = %namespace, name = %name, generation, "wrote resource");
        self.notify();
        Ok(resource)
    }

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> Result<()> {
        let removed = self
            .store
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => {
                debug!(kind = %self.kind, namespace, name, "deleted resource");
                self.notify();
                Ok(())
            }
            None if opts.ignore_not_exist => Ok(()),
            None => Err(CoreError::not_found(&self.kind, namespace, name)),
        }
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let store = self.store.read().await;
        Ok(store
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| want == ns))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn subscribe(&self) -> BoxStream<'static, ()> {
        let rx = self.changes.subscribe();
        stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}

/// Spec writes start over at Pending; only `apply_status` reports
fn without_status<K: ClientResource>(resource: K) -> Result<K> {
    let mut value = serde_json::to_value(resource)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("status");
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<K: ClientResource + HasStatus> StatusClient<K> for MemoryResourceClient<K> {
    async fn apply_status(&self, namespace: &str, name: &str, status: Status) -> Result<K> {
        let mut store = self.store.write().await;
        let resource = store
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| CoreError::not_found(&self.kind, namespace, name))?;
        resource.set_status(status);
        resource.meta_mut().resource_version = Some(self.next_version());
        Ok(resource.clone())
    }
}
