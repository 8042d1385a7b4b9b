//! Translation plugins
//!
//! Each plugin owns one feature of the compiled configuration. The
//! [`ProxyTranslator`](crate::ProxyTranslator) builds the skeleton of every
//! cluster, load assignment, listener and connection manager, then lets the
//! registered plugins fill in their part. A plugin error is reported against
//! the resource being translated and never aborts translation.

pub mod access_log;
pub mod ext_auth;
pub mod failover;
pub mod grpc;
pub mod http_filters;
pub mod listener;
pub mod tls;
pub mod tracing;
pub mod tunnel;
pub mod upstream;

use crate::Result;
use edge_api::v1::proxy::{HttpListener, Listener};
use edge_api::xds::{self, Cluster, ClusterLoadAssignment, HttpConnectionManager};
use edge_api::Upstream;
use edge_core::{ApiSnapshot, Endpoint};
use std::collections::HashMap;

/// Inputs shared by every plugin during one translation
pub struct Params<'a> {
    pub snapshot: &'a ApiSnapshot,
    /// Discovered endpoints keyed by upstream `namespace.name`
    pub endpoints: &'a HashMap<String, Vec<Endpoint>>,
}

impl<'a> Params<'a> {
    pub fn new(snapshot: &'a ApiSnapshot, endpoints: &'a HashMap<String, Vec<Endpoint>>) -> Self {
        Self { snapshot, endpoints }
    }
}

pub trait UpstreamPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn process_upstream(&self, params: &Params<'_>, upstream: &Upstream, cluster: &mut Cluster) -> Result<()>;
}

pub trait EndpointPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn process_endpoints(
        &self,
        params: &Params<'_>,
        upstream: &Upstream,
        assignment: &mut ClusterLoadAssignment,
    ) -> Result<()>;
}

pub trait ListenerPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn process_listener(&self, params: &Params<'_>, listener: &Listener, out: &mut xds::Listener) -> Result<()>;
}

/// Plugins contributing HTTP filters or connection-manager settings
pub trait HttpConnectionManagerPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn process_hcm(
        &self,
        params: &Params<'_>,
        http: &HttpListener,
        hcm: &mut HttpConnectionManager,
    ) -> Result<()>;
}

/// The plugins a translator runs, in order
pub struct PluginRegistry {
    pub upstream: Vec<Box<dyn UpstreamPlugin>>,
    pub endpoint: Vec<Box<dyn EndpointPlugin>>,
    pub listener: Vec<Box<dyn ListenerPlugin>>,
    pub http: Vec<Box<dyn HttpConnectionManagerPlugin>>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            upstream: Vec::new(),
            endpoint: Vec::new(),
            listener: Vec::new(),
            http: Vec::new(),
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self {
            upstream: vec![
                Box::new(upstream::UpstreamBasePlugin),
                Box::new(tls::UpstreamTlsPlugin),
                Box::new(tunnel::HttpTunnelPlugin),
                Box::new(grpc::GrpcJsonTranscoderPlugin),
            ],
            endpoint: vec![Box::new(failover::FailoverPlugin)],
            listener: vec![
                Box::new(listener::ProxyProtocolPlugin),
                Box::new(access_log::AccessLogPlugin),
            ],
            http: vec![
                Box::new(grpc::GrpcWebPlugin),
                Box::new(http_filters::CorsPlugin),
                Box::new(ext_auth::ExtAuthPlugin),
                Box::new(http_filters::DlpPlugin),
                Box::new(http_filters::RateLimitPlugin),
                Box::new(tracing::TracingPlugin),
            ],
        }
    }
}
