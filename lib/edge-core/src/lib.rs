//! Core control-plane functionality
//!
//! This library provides:
//! - Resource clients (in-memory and Kubernetes) with namespace-scoped CRUD
//! - Resource reports that turn translation errors into statuses
//! - The API snapshot the translator works from
//! - An endpoint registry for discovered upstream endpoints
//! - Settings and logging shared by the binaries

pub mod client;
pub mod endpoint;
pub mod error;
pub mod kube_client;
pub mod logging;
pub mod memory;
pub mod registry;
pub mod reports;
pub mod settings;
pub mod snapshot;

pub use client::{ClientResource, DeleteOpts, ResourceClient, StatusClient, WriteOpts};
pub use endpoint::Endpoint;
pub use error::{CoreError, Result};
pub use kube_client::KubeResourceClient;
pub use memory::MemoryResourceClient;
pub use registry::EndpointRegistry;
pub use reports::{ResourceKind, ResourceReports};
pub use settings::Settings;
pub use snapshot::ApiSnapshot;
