//! Snapshot cache
//!
//! Holds the latest snapshot per data-plane node. Discovery requests long-poll
//! on [`SnapshotCache::next_version`] until the node's snapshot differs from
//! the version the caller already has.

use edge_api::xds::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::debug;

type Slot = watch::Sender<Option<Arc<Snapshot>>>;

/// Cloning shares the underlying cache
#[derive(Clone, Default)]
pub struct SnapshotCache {
    nodes: Arc<RwLock<HashMap<String, Slot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a snapshot for `node`, returning false when it carries the
    /// version already stored
    pub async fn set_snapshot(&self, node: &str, snapshot: Snapshot) -> bool {
        let slot = self.slot(node).await;
        let version = snapshot.version.clone();
        let changed = slot.send_if_modified(|current| {
            if current.as_ref().is_some_and(|s| s.version == version) {
                return false;
            }
            *current = Some(Arc::new(snapshot));
            true
        });
        if changed {
            debug!(node = %node, version = %version, "Snapshot updated");
        }
        changed
    }

    pub async fn snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        let nodes = self.nodes.read().await;
        nodes.get(node).and_then(|slot| slot.borrow().clone())
    }

    /// Receiver that observes every snapshot stored for `node`
    pub async fn watch(&self, node: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.slot(node).await.subscribe()
    }

    /// Wait up to `timeout` for a snapshot whose version differs from `known`
    ///
    /// Returns immediately when the stored version already differs. `None`
    /// means nothing new arrived in time.
    pub async fn next_version(&self, node: &str, known: Option<&str>, timeout: Duration) -> Option<Arc<Snapshot>> {
        let mut rx = self.watch(node).await;
        let is_new = |s: &Option<Arc<Snapshot>>| {
            s.as_ref()
                .is_some_and(|s| known.map_or(true, |v| s.version != v))
        };

        let wait = async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if is_new(&current) {
                        return current.clone();
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Forget a node; pending watchers see `None`
    pub async fn clear(&self, node: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(slot) = nodes.remove(node) {
            slot.send_replace(None);
            debug!(node = %node, "Snapshot cleared");
        }
    }

    /// Nodes that currently have a snapshot
    pub async fn nodes(&self) -> Vec<String> {
        let nodes = self.nodes.read().await;
        let mut names: Vec<String> = nodes
            .iter()
            .filter(|(_, slot)| slot.borrow().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    async fn slot(&self, node: &str) -> Slot {
        if let Some(slot) = self.nodes.read().await.get(node) {
            return slot.clone();
        }
        let mut nodes = self.nodes.write().await;
        nodes
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::xds::Cluster;

    fn snapshot(cluster: &str) -> Snapshot {
        Snapshot::new(
            vec![],
            vec![],
            vec![Cluster {
                name: cluster.into(),
                ..Default::default()
            }],
            vec![],
        )
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let cache = SnapshotCache::new();
        assert!(cache.set_snapshot("default~proxy", snapshot("a")).await);
        assert!(!cache.set_snapshot("default~proxy", snapshot("a")).await);
        assert!(cache.set_snapshot("default~proxy", snapshot("b")).await);
        assert_eq!(cache.nodes().await, vec!["default~proxy"]);

        cache.clear("default~proxy").await;
        assert!(cache.snapshot("default~proxy").await.is_none());
        assert!(cache.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_next_version_long_poll() {
        let cache = SnapshotCache::new();
        let first = snapshot("a");
        let first_version = first.version.clone();
        cache.set_snapshot("node", first).await;

        let current = cache.next_version("node", None, Duration::from_millis(10)).await;
        assert_eq!(current.unwrap().version, first_version);

        let timed_out = cache
            .next_version("node", Some(&first_version), Duration::from_millis(20))
            .await;
        assert!(timed_out.is_none());

        let waiter = {
            let cache = cache.clone();
            let known = first_version.clone();
            tokio::spawn(async move { cache.next_version("node", Some(&known), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set_snapshot("node", snapshot("b")).await;

        let next = waiter.await.unwrap().unwrap();
        assert_ne!(next.version, first_version);
    }
}
