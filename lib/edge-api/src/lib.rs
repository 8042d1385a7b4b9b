//! Edge gateway API types and CRDs
//!
//! This library defines the custom resources consumed by the control plane:
//! - Upstream: a backend service (static hosts, health checks, failover)
//! - Proxy: a compiled listener set served by the data plane
//! - Gateway: a listener declaration that selects virtual services
//! - VirtualService: domains and routes for one virtual host
//! - Secret: TLS, OAuth, header or generic credential material
//!
//! The [`xds`] module holds the proxy configuration the translator emits and
//! the data plane consumes.

pub mod v1;
pub mod xds;

pub use v1::{Gateway, Proxy, Secret, Upstream, VirtualService};
pub use v1::core::{HasStatus, ResourceRef, Status, StatusState};
