//! Attributing proxy errors to the resources a proxy was generated from

use edge_api::ResourceRef;
use edge_core::{ResourceKind, ResourceReports};
use std::collections::HashMap;

/// Which Gateway produced each listener and which VirtualService produced
/// each virtual host of a generated Proxy
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProxySources {
    pub listeners: HashMap<String, ResourceRef>,
    pub virtual_hosts: HashMap<String, ResourceRef>,
}

/// Records problems found in a Proxy
///
/// Errors always land on the Proxy. When the Proxy was generated, listener
/// problems are also reported on the source Gateway and virtual host problems
/// on the source VirtualService.
pub struct ProxyReporter<'a> {
    proxy: ResourceRef,
    reports: &'a mut ResourceReports,
    sources: Option<&'a ProxySources>,
}

impl<'a> ProxyReporter<'a> {
    pub fn new(
        proxy: ResourceRef,
        reports: &'a mut ResourceReports,
        sources: Option<&'a ProxySources>,
    ) -> Self {
        reports.accept(ResourceKind::Proxy, &proxy);
        Self {
            proxy,
            reports,
            sources,
        }
    }

    pub fn proxy(&self) -> &ResourceRef {
        &self.proxy
    }

    pub fn error(&mut self, err: impl Into<String>) {
        self.reports.add_error(ResourceKind::Proxy, &self.proxy, err);
    }

    pub fn warning(&mut self, warning: impl Into<String>) {
        self.reports.add_warning(ResourceKind::Proxy, &self.proxy, warning);
    }

    pub fn listener_error(&mut self, listener: &str, err: impl Into<String>) {
        let err = err.into();
        if let Some(gateway) = self.sources.and_then(|s| s.listeners.get(listener)) {
            self.reports.add_error(ResourceKind::Gateway, gateway, err.clone());
        }
        self.error(err);
    }

    pub fn virtual_host_error(&mut self, listener: &str, virtual_host: &str, err: impl Into<String>) {
        let err = err.into();
        match self.sources.and_then(|s| s.virtual_hosts.get(virtual_host)) {
            Some(vs) => self.reports.add_error(ResourceKind::VirtualService, vs, err.clone()),
            None => {
                if let Some(gateway) = self.sources.and_then(|s| s.listeners.get(listener)) {
                    self.reports.add_error(ResourceKind::Gateway, gateway, err.clone());
                }
            }
        }
        self.error(err);
    }

    pub fn virtual_host_warning(&mut self, virtual_host: &str, warning: impl Into<String>) {
        let warning = warning.into();
        if let Some(vs) = self.sources.and_then(|s| s.virtual_hosts.get(virtual_host)) {
            self.reports.add_warning(ResourceKind::VirtualService, vs, warning.clone());
        }
        self.warning(warning);
    }

    pub fn upstream_error(&mut self, upstream: &ResourceRef, err: impl Into<String>) {
        self.reports.add_error(ResourceKind::Upstream, upstream, err);
    }

    pub fn has_errors(&self) -> bool {
        self.reports.has_errors(ResourceKind::Proxy, &self.proxy)
    }
}
