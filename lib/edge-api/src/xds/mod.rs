//! Compiled proxy configuration
//!
//! The translator renders every Proxy into a [`Snapshot`] of clusters,
//! endpoint assignments, listeners and route configurations. The data plane
//! fetches snapshots from the discovery server and never sees the
//! higher-level resources.

pub mod auth;
pub mod cluster;
pub mod listener;
pub mod route;
pub mod snapshot;

pub use auth::{ApiKeyCheck, ApiKeyIdentity, AuthCheck, AuthPolicy, BasicCheck, IntrospectionCheck};
pub use cluster::{
    Cluster, ClusterKind, HttpConnectTunnel, UpstreamTls, ClusterLoadAssignment, LbEndpoint,
    LocalityLbEndpoints,
};
pub use listener::{
    DownstreamTls, FilterChain, FilterChainMatch, HttpConnectionManager, FilterStage, HttpFilter,
    Listener, NetworkFilter, TcpProxy,
};
pub use route::{EnvoyAction, EnvoyRoute, EnvoyVirtualHost, RouteConfiguration, RoutePolicies, WeightedCluster};
pub use snapshot::Snapshot;

/// Cluster name for an upstream: `{name}_{namespace}`
pub fn cluster_name(upstream: &crate::ResourceRef) -> String {
    format!("{}_{}", upstream.name, upstream.namespace)
}

/// Node id of the data plane serving a proxy: `{namespace}~{name}`
pub fn node_id(namespace: &str, proxy_name: &str) -> String {
    format!("{}~{}", namespace, proxy_name)
}
