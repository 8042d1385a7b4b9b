//! Listener-level options

use super::{ListenerPlugin, Params};
use crate::Result;
use edge_api::v1::proxy::Listener;
use edge_api::xds;

pub const PROXY_PROTOCOL_FILTER: &str = "proxy_protocol";

pub struct ProxyProtocolPlugin;

impl ListenerPlugin for ProxyProtocolPlugin {
    fn name(&self) -> &'static str {
        PROXY_PROTOCOL_FILTER
    }

    fn process_listener(&self, _params: &Params<'_>, listener: &Listener, out: &mut xds::Listener) -> Result<()> {
        if let Some(pp) = &listener.options.proxy_protocol {
            if !out.has_listener_filter(PROXY_PROTOCOL_FILTER) {
                out.listener_filters.push(PROXY_PROTOCOL_FILTER.to_string());
            }
            out.proxy_protocol_optional = pp.allow_requests_without_proxy_protocol;
        }
        out.per_connection_buffer_limit_bytes = listener.options.per_connection_buffer_limit_bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::options::{ListenerOptions, ProxyProtocol};
    use edge_core::ApiSnapshot;
    use std::collections::HashMap;

    #[test]
    fn test_proxy_protocol_listener_filter() {
        let snapshot = ApiSnapshot::default();
        let endpoints = HashMap::new();
        let params = Params::new(&snapshot, &endpoints);
        let listener = Listener {
            name: "http".into(),
            options: ListenerOptions {
                proxy_protocol: Some(ProxyProtocol {
                    allow_requests_without_proxy_protocol: true,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut out = xds::Listener::default();
        ProxyProtocolPlugin.process_listener(&params, &listener, &mut out).unwrap();
        ProxyProtocolPlugin.process_listener(&params, &listener, &mut out).unwrap();
        assert_eq!(out.listener_filters, vec![PROXY_PROTOCOL_FILTER]);
        assert!(out.proxy_protocol_optional);
    }
}
