//! Registry of discovered upstream endpoints

use crate::{CoreError, Endpoint, Result};
use edge_api::ResourceRef;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// EndpointRegistry maps upstreams to the endpoints discovery found for them
///
/// Cloning shares the underlying map.
#[derive(Clone)]
pub struct EndpointRegistry {
    // Map of upstream key (namespace.name) to endpoints
    upstreams: Arc<RwLock<HashMap<String, Vec<Endpoint>>>>,
    changes: broadcast::Sender<()>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            upstreams: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Receives once per effective change
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    /// Replace the endpoints of an upstream, returning true when they changed
    pub async fn update_endpoints(&self, upstream: &ResourceRef, endpoints: Vec<Endpoint>) -> bool {
        let key = upstream.key();
        let mut upstreams = self.upstreams.write().await;
        if upstreams.get(&key) == Some(&endpoints) {
            return false;
        }
        debug!("Updated {} endpoints for upstream: {}", endpoints.len(), key);
        upstreams.insert(key, endpoints);
        let _ = self.changes.send(());
        true
    }

    /// Ready endpoints of an upstream
    pub async fn get_endpoints(&self, upstream: &ResourceRef) -> Result<Vec<Endpoint>> {
        let upstreams = self.upstreams.read().await;
        upstreams
            .get(&upstream.key())
            .map(|eps| eps.iter().filter(|e| e.ready).cloned().collect())
            .ok_or_else(|| CoreError::not_found("Endpoints", &upstream.namespace, &upstream.name))
    }

    /// Copy of the whole registry, keyed by `namespace.name`
    pub async fn snapshot(&self) -> HashMap<String, Vec<Endpoint>> {
        self.upstreams.read().await.clone()
    }

    pub async fn remove(&self, upstream: &ResourceRef) {
        let mut upstreams = self.upstreams.write().await;
        if upstreams.remove(&upstream.key()).is_some() {
            debug!("Removed endpoints for upstream: {}", upstream);
            let _ = self.changes.send(());
        }
    }

    pub async fn upstream_count(&self) -> usize {
        self.upstreams.read().await.len()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_reports_changes() {
        let registry = EndpointRegistry::new();
        let mut changes = registry.subscribe();
        let us = ResourceRef::new("default", "petstore");

        assert!(registry.get_endpoints(&us).await.is_err());
        assert!(registry.update_endpoints(&us, vec![Endpoint::new("10.0.0.1", 80)]).await);
        assert!(!registry.update_endpoints(&us, vec![Endpoint::new("10.0.0.1", 80)]).await);
        assert!(changes.try_recv().is_ok());
        assert!(changes.try_recv().is_err());

        let mut not_ready = Endpoint::new("10.0.0.2", 80);
        not_ready.ready = false;
        registry
            .update_endpoints(&us, vec![Endpoint::new("10.0.0.1", 80), not_ready])
            .await;
        assert_eq!(registry.get_endpoints(&us).await.unwrap().len(), 1);

        registry.remove(&us).await;
        assert_eq!(registry.upstream_count().await, 0);
    }
}
