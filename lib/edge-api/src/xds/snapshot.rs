use super::cluster::{Cluster, ClusterLoadAssignment};
use super::listener::Listener;
use super::route::RouteConfiguration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Immutable, versioned set of resources for one data-plane node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: String,

    #[serde(default)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    pub route_configurations: Vec<RouteConfiguration>,

    #[serde(default)]
    pub clusters: Vec<Cluster>,

    #[serde(default)]
    pub cluster_load_assignments: Vec<ClusterLoadAssignment>,
}

impl Snapshot {
    /// Build a snapshot whose version is the hash of its content
    pub fn new(
        listeners: Vec<Listener>,
        route_configurations: Vec<RouteConfiguration>,
        clusters: Vec<Cluster>,
        cluster_load_assignments: Vec<ClusterLoadAssignment>,
    ) -> Self {
        let mut snapshot = Self {
            version: String::new(),
            listeners,
            route_configurations,
            clusters,
            cluster_load_assignments,
        };
        snapshot.version = snapshot.compute_version();
        snapshot
    }

    /// Hex SHA-256 over the serialized resources
    pub fn compute_version(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            serde_json::to_vec(&self.listeners),
            serde_json::to_vec(&self.route_configurations),
            serde_json::to_vec(&self.clusters),
            serde_json::to_vec(&self.cluster_load_assignments),
        ] {
            // Serializing plain data structures cannot fail
            hasher.update(part.unwrap_or_default());
        }
        hex::encode(&hasher.finalize()[..8])
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn load_assignment(&self, cluster_name: &str) -> Option<&ClusterLoadAssignment> {
        self.cluster_load_assignments
            .iter()
            .find(|c| c.cluster_name == cluster_name)
    }

    pub fn route_configuration(&self, name: &str) -> Option<&RouteConfiguration> {
        self.route_configurations.iter().find(|r| r.name == name)
    }

    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }
}
