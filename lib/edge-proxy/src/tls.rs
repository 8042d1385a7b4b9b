//! TLS termination for listeners and origination for clusters

use crate::error::ProxyError;
use crate::Result;
use edge_api::xds::{DownstreamTls, UpstreamTls};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, read_all, Item};
use std::io::BufReader;
use std::sync::Arc;
use tracing::debug;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle
pub fn load_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let certs = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls("no certificates found in PEM data".into()));
    }
    Ok(certs)
}

/// First PKCS#8, SEC1 or PKCS#1 key in a PEM bundle
pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    for item in read_all(&mut reader) {
        let item = item.map_err(|e| ProxyError::Tls(format!("failed to parse private key: {}", e)))?;
        match item {
            Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            _ => {}
        }
    }
    Err(ProxyError::Tls("no private key found in PEM data".into()))
}

fn root_store(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(pem)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn alpn(protocols: &[String]) -> Vec<Vec<u8>> {
    if protocols.is_empty() {
        vec![b"http/1.1".to_vec()]
    } else {
        protocols.iter().map(|p| p.as_bytes().to_vec()).collect()
    }
}

/// Server config for a filter chain. A root CA turns on client certificate
/// verification.
pub fn server_config(tls: &DownstreamTls) -> Result<Arc<ServerConfig>> {
    let certs = load_certificates(tls.cert_chain.as_bytes())?;
    let key = load_private_key(tls.private_key.as_bytes())?;
    let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;

    let mut config = if tls.root_ca.is_empty() {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    } else {
        let roots = root_store(tls.root_ca.as_bytes())?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .map_err(|e| ProxyError::Tls(format!("failed to build client verifier: {}", e)))?;
        debug!("Requiring client certificates");
        builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
    };
    config.alpn_protocols = alpn(&tls.alpn_protocols);
    Ok(Arc::new(config))
}

/// Client config for a cluster. Without a root CA the server certificate is
/// not verified.
pub fn client_config(tls: &UpstreamTls, http2: bool) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
    let builder = if tls.root_ca.is_empty() {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider())))
    } else {
        builder.with_root_certificates(root_store(tls.root_ca.as_bytes())?)
    };

    let mut config = if tls.cert_chain.is_empty() {
        builder.with_no_client_auth()
    } else {
        let certs = load_certificates(tls.cert_chain.as_bytes())?;
        let key = load_private_key(tls.private_key.as_bytes())?;
        builder.with_client_auth_cert(certs, key)?
    };

    config.alpn_protocols = if !tls.alpn_protocols.is_empty() {
        alpn(&tls.alpn_protocols)
    } else if http2 {
        vec![b"h2".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(Arc::new(config))
}

/// SNI for an upstream connection: the configured name or the host address
pub fn server_name(tls: &UpstreamTls, host: &str) -> Result<ServerName<'static>> {
    let name = tls.sni.clone().unwrap_or_else(|| host.to_string());
    ServerName::try_from(name.clone())
        .map_err(|_| ProxyError::Tls(format!("invalid server name {}", name)))
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
