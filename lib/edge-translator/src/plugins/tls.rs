//! TLS material resolved from secrets

use super::{Params, UpstreamPlugin};
use crate::{Result, TranslateError};
use edge_api::v1::options::{SslConfig, UpstreamSslConfig};
use edge_api::v1::secret::TlsSecret;
use edge_api::xds::{DownstreamTls, UpstreamTls};
use edge_api::{ResourceRef, Upstream};
use edge_core::ApiSnapshot;
use kube::ResourceExt;

/// Look up a TLS secret by reference
pub fn resolve_tls<'a>(snapshot: &'a ApiSnapshot, secret: &ResourceRef) -> Result<&'a TlsSecret> {
    snapshot
        .secret(secret)
        .ok_or_else(|| TranslateError::SecretNotFound(secret.clone()))?
        .spec
        .kind
        .as_tls()
        .ok_or_else(|| TranslateError::NotTlsSecret(secret.clone()))
}

/// Server-side TLS for a listener filter chain
pub fn downstream_tls(snapshot: &ApiSnapshot, ssl: &SslConfig, namespace: &str) -> Result<DownstreamTls> {
    let secret = ssl.secret_ref.as_ref().ok_or_else(|| {
        TranslateError::InvalidConfiguration("ssl config does not reference a secret".into())
    })?;
    let tls = resolve_tls(snapshot, &secret.in_namespace(namespace))?;
    Ok(DownstreamTls {
        cert_chain: tls.cert_chain.clone(),
        private_key: tls.private_key.clone(),
        root_ca: tls.root_ca.clone(),
        alpn_protocols: ssl.alpn_protocols.clone(),
    })
}

/// Client TLS for an upstream or one of its failover endpoints
pub fn upstream_tls(
    snapshot: &ApiSnapshot,
    ssl: &UpstreamSslConfig,
    namespace: &str,
    default_sni: Option<String>,
) -> Result<UpstreamTls> {
    let mut tls = UpstreamTls {
        sni: ssl.sni.clone().or(default_sni),
        alpn_protocols: ssl.alpn_protocols.clone(),
        ..Default::default()
    };
    if let Some(secret) = &ssl.secret_ref {
        let material = resolve_tls(snapshot, &secret.in_namespace(namespace))?;
        tls.cert_chain = material.cert_chain.clone();
        tls.private_key = material.private_key.clone();
        tls.root_ca = material.root_ca.clone();
    }
    Ok(tls)
}

/// TLS origination towards an upstream
pub struct UpstreamTlsPlugin;

impl UpstreamPlugin for UpstreamTlsPlugin {
    fn name(&self) -> &'static str {
        "upstream_ssl"
    }

    fn process_upstream(
        &self,
        params: &Params<'_>,
        upstream: &Upstream,
        cluster: &mut edge_api::xds::Cluster,
    ) -> Result<()> {
        let spec = &upstream.spec;
        // Hostnames double as SNI when nothing else is configured
        let default_sni = spec
            .static_hosts
            .iter()
            .find(|h| !h.is_ip())
            .map(|h| h.addr.clone());

        if let Some(ssl) = &spec.ssl_config {
            let namespace = upstream.namespace().unwrap_or_default();
            cluster.tls = Some(upstream_tls(params.snapshot, ssl, &namespace, default_sni)?);
        } else if spec.use_tls {
            cluster.tls = Some(UpstreamTls {
                sni: default_sni,
                ..Default::default()
            });
        }
        Ok(())
    }
}
