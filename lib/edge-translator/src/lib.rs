//! Translation from gateway resources to data-plane configuration
//!
//! Gateways and VirtualServices are rendered into Proxies by the
//! [`GatewayTranslator`]. Every Proxy is then validated and compiled by the
//! [`ProxyTranslator`] into an xDS [`Snapshot`](edge_api::xds::Snapshot) that
//! the [`SnapshotCache`] serves to data-plane nodes. The [`TranslatorSyncer`]
//! drives the whole loop and writes the resulting statuses back.

pub mod cache;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod plugins;
pub mod policy;
pub mod reporter;
pub mod syncer;
pub mod translator;
pub mod validation;

#[cfg(test)]
mod testutil;

pub use cache::SnapshotCache;
pub use error::{Result, TranslateError};
pub use gateway::{GatewayTranslator, GeneratedProxy};
pub use metrics::TranslatorMetrics;
pub use reporter::{ProxyReporter, ProxySources};
pub use syncer::{Clients, SyncSummary, TranslatorSyncer};
pub use translator::{ProxyTranslator, TranslatorOptions, UpstreamTranslation};
