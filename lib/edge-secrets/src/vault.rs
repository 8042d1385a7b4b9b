//! Secrets stored in a Vault KV v2 engine
//!
//! A secret `namespace.name` lives at
//! `{path_prefix}/data/{root_key}/{namespace}/{name}` and its spec is stored
//! as the KV payload.

use crate::{Precedence, Result, SecretError, SecretSource};
use async_trait::async_trait;
use edge_api::v1::secret::SecretSpec;
use edge_api::{ResourceRef, Secret};
use edge_core::settings::VaultSettings;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

const TOKEN_HEADER: &str = "X-Vault-Token";

pub struct VaultSecretSource {
    http: Client,
    address: String,
    token: String,
    path_prefix: String,
    root_key: String,
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: KvData,
}

#[derive(Deserialize)]
struct KvData {
    data: Value,
}

#[derive(Deserialize)]
struct KvListResponse {
    data: KvKeys,
}

#[derive(Deserialize)]
struct KvKeys {
    #[serde(default)]
    keys: Vec<String>,
}

impl VaultSecretSource {
    pub fn new(settings: &VaultSettings) -> Self {
        Self {
            http: Client::new(),
            address: settings.address.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            path_prefix: settings.path_prefix.trim_matches('/').to_string(),
            root_key: settings.root_key.trim_matches('/').to_string(),
        }
    }

    fn data_path(&self, secret: &ResourceRef) -> String {
        format!(
            "{}/data/{}/{}/{}",
            self.path_prefix, self.root_key, secret.namespace, secret.name
        )
    }

    fn metadata_path(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}/metadata/{}", self.path_prefix, self.root_key)
        } else {
            format!("{}/metadata/{}/{}", self.path_prefix, self.root_key, suffix)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path)
    }

    async fn list_keys(&self, path: &str) -> Result<Vec<String>> {
        let list = Method::from_bytes(b"LIST").map_err(|e| SecretError::Vault {
            status: 0,
            path: path.to_string(),
            message: e.to_string(),
        })?;
        let resp = self
            .http
            .request(list, self.url(path))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            s if s.is_success() => Ok(resp.json::<KvListResponse>().await?.data.keys),
            s => Err(SecretError::Vault {
                status: s.as_u16(),
                path: path.to_string(),
                message: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let keys = self.list_keys(&self.metadata_path("")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_suffix('/').map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl SecretSource for VaultSecretSource {
    fn name(&self) -> &str {
        "vault"
    }

    fn precedence(&self) -> Precedence {
        Precedence::Vault
    }

    async fn read(&self, secret: &ResourceRef) -> Result<Secret> {
        let path = self.data_path(secret);
        let resp = self
            .http
            .get(self.url(&path))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(SecretError::NotFound(secret.clone())),
            s if !s.is_success() => {
                return Err(SecretError::Vault {
                    status: s.as_u16(),
                    path,
                    message: resp.text().await.unwrap_or_default(),
                })
            }
            _ => {}
        }

        let body: KvReadResponse = resp.json().await?;
        let spec: SecretSpec = serde_json::from_value(body.data.data)
            .map_err(|e| SecretError::Decode(secret.clone(), e.to_string()))?;

        debug!("Read secret {} from vault", secret);
        let mut out = Secret::new(&secret.name, spec);
        out.metadata.namespace = Some(secret.namespace.clone());
        Ok(out)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Secret>> {
        let namespaces = match namespace {
            Some(ns) => vec![ns.to_string()],
            None => self.namespaces().await?,
        };

        let mut secrets = Vec::new();
        for ns in namespaces {
            for name in self.list_keys(&self.metadata_path(&ns)).await? {
                if name.ends_with('/') {
                    continue;
                }
                match self.read(&ResourceRef::new(ns.clone(), name)).await {
                    Ok(secret) => secrets.push(secret),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("Failed to read secret from vault: {}", e),
                }
            }
        }
        Ok(secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::secret::{SecretKind, TlsSecret};
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    async fn fake_vault(req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let authorized = req
            .headers()
            .get(TOKEN_HEADER)
            .is_some_and(|v| v == "root");
        if !authorized {
            return Ok(Response::builder().status(403).body(Full::new(Bytes::from("denied"))).unwrap());
        }

        let body = match (req.method().as_str(), req.uri().path()) {
            ("GET", "/v1/secret/data/gateway/default/tls") => serde_json::json!({
                "data": { "data": { "kind": { "tls": {
                    "certChain": "CERT", "privateKey": "KEY"
                }}}}
            }),
            ("LIST", "/v1/secret/metadata/gateway") => {
                serde_json::json!({ "data": { "keys": ["default/"] } })
            }
            ("LIST", "/v1/secret/metadata/gateway/default") => {
                serde_json::json!({ "data": { "keys": ["tls", "missing"] } })
            }
            _ => {
                return Ok(Response::builder().status(404).body(Full::new(Bytes::new())).unwrap());
            }
        };
        Ok(Response::new(Full::new(Bytes::from(body.to_string()))))
    }

    async fn serve() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(fake_vault))
                        .await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn source(address: String, token: &str) -> VaultSecretSource {
        VaultSecretSource::new(&VaultSettings {
            address,
            token: token.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_read_by_ref() {
        let vault = source(serve().await, "root");
        let secret = vault.read(&ResourceRef::new("default", "tls")).await.unwrap();
        assert_eq!(
            secret.spec.kind,
            SecretKind::Tls(TlsSecret {
                cert_chain: "CERT".into(),
                private_key: "KEY".into(),
                root_ca: String::new(),
            })
        );

        let err = vault.read(&ResourceRef::new("default", "nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_all_namespaces() {
        let vault = source(serve().await, "root");
        let secrets = vault.list(None).await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].metadata.name.as_deref(), Some("tls"));
    }

    #[tokio::test]
    async fn test_bad_token() {
        let vault = source(serve().await, "wrong");
        let err = vault.read(&ResourceRef::new("default", "tls")).await.unwrap_err();
        assert!(matches!(err, SecretError::Vault { status: 403, .. }));
    }
}
