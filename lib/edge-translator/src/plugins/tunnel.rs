//! HTTP CONNECT tunnelling through the upstream hosts

use super::{Params, UpstreamPlugin};
use crate::{Result, TranslateError};
use edge_api::xds::{Cluster, HttpConnectTunnel};
use edge_api::Upstream;

pub struct HttpTunnelPlugin;

impl UpstreamPlugin for HttpTunnelPlugin {
    fn name(&self) -> &'static str {
        "tunneling"
    }

    fn process_upstream(&self, _params: &Params<'_>, upstream: &Upstream, cluster: &mut Cluster) -> Result<()> {
        let spec = &upstream.spec;
        let Some(hostname) = spec.http_proxy_hostname.as_deref() else {
            if !spec.http_connect_headers.is_empty() {
                return Err(TranslateError::InvalidConfiguration(
                    "httpConnectHeaders require httpProxyHostname".into(),
                ));
            }
            return Ok(());
        };
        if hostname.is_empty() {
            return Err(TranslateError::InvalidConfiguration(
                "httpProxyHostname must not be empty".into(),
            ));
        }
        cluster.http_connect_tunnel = Some(HttpConnectTunnel {
            hostname: hostname.to_string(),
            headers: spec.http_connect_headers.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::static_upstream;
    use edge_core::ApiSnapshot;
    use std::collections::HashMap;

    #[test]
    fn test_tunnel_config() {
        let snapshot = ApiSnapshot::default();
        let endpoints = HashMap::new();
        let params = Params::new(&snapshot, &endpoints);

        let mut us = static_upstream("default", "via-proxy", "10.0.0.1", 3128);
        us.spec.http_proxy_hostname = Some("backend.internal:443".into());
        us.spec
            .http_connect_headers
            .insert("proxy-authorization".into(), "Basic Zm9vOmJhcg==".into());
        let mut cluster = Cluster::default();
        HttpTunnelPlugin.process_upstream(&params, &us, &mut cluster).unwrap();
        let tunnel = cluster.http_connect_tunnel.unwrap();
        assert_eq!(tunnel.hostname, "backend.internal:443");
        assert_eq!(tunnel.headers.len(), 1);

        let mut headers_only = static_upstream("default", "bad", "10.0.0.1", 3128);
        headers_only.spec.http_connect_headers.insert("x".into(), "y".into());
        assert!(HttpTunnelPlugin
            .process_upstream(&params, &headers_only, &mut Cluster::default())
            .is_err());
    }
}
