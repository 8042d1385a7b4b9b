//! Secrets read from core Kubernetes `Secret` objects

use crate::{Precedence, Result, SecretError, SecretSource};
use async_trait::async_trait;
use edge_api::v1::secret::{GenericSecret, HeaderSecret, OauthSecret, SecretKind, SecretSpec, TlsSecret};
use edge_api::{ResourceRef, Secret};
use k8s_openapi::api::core::v1::Secret as KubeSecret;
use k8s_openapi::ByteString;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Annotation selecting how an opaque secret is interpreted
pub const KIND_ANNOTATION: &str = "gateway.edge.dev/kind";

const TLS_TYPE: &str = "kubernetes.io/tls";
const SERVICE_ACCOUNT_TYPE: &str = "kubernetes.io/service-account-token";

pub struct KubernetesSecretSource {
    client: Client,
}

impl KubernetesSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubernetesSecretSource {
    fn name(&self) -> &str {
        "kubernetes"
    }

    fn precedence(&self) -> Precedence {
        Precedence::Kubernetes
    }

    async fn read(&self, secret: &ResourceRef) -> Result<Secret> {
        let api: Api<KubeSecret> = Api::namespaced(self.client.clone(), &secret.namespace);
        match api.get_opt(&secret.name).await? {
            Some(kube_secret) => convert(&kube_secret),
            None => Err(SecretError::NotFound(secret.clone())),
        }
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Secret>> {
        let api: Api<KubeSecret> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;

        let secrets: Vec<Secret> = list
            .items
            .iter()
            .filter(|s| s.type_.as_deref() != Some(SERVICE_ACCOUNT_TYPE))
            .filter_map(|s| match convert(s) {
                Ok(secret) => Some(secret),
                Err(e) => {
                    debug!("Skipping secret {}: {}", s.name_any(), e);
                    None
                }
            })
            .collect();

        debug!("Listed {} secrets from Kubernetes", secrets.len());
        Ok(secrets)
    }
}

/// Convert a core Secret into a gateway Secret
///
/// `kubernetes.io/tls` secrets become TLS secrets; opaque secrets are OAuth or
/// header secrets when annotated with [`KIND_ANNOTATION`], generic otherwise.
pub fn convert(kube_secret: &KubeSecret) -> Result<Secret> {
    let reference = ResourceRef::new(
        kube_secret.namespace().unwrap_or_default(),
        kube_secret.name_any(),
    );
    let data = decode_data(kube_secret.data.as_ref(), &reference)?;
    let field = |key: &str| data.get(key).cloned().unwrap_or_default();

    let kind = if kube_secret.type_.as_deref() == Some(TLS_TYPE) {
        SecretKind::Tls(TlsSecret {
            cert_chain: field("tls.crt"),
            private_key: field("tls.key"),
            root_ca: field("ca.crt"),
        })
    } else {
        match kube_secret.annotations().get(KIND_ANNOTATION).map(String::as_str) {
            Some("oauth") => {
                let client_secret = data.get("client-secret").cloned().ok_or_else(|| {
                    SecretError::Decode(reference.clone(), "missing client-secret key".into())
                })?;
                SecretKind::Oauth(OauthSecret { client_secret })
            }
            Some("header") => SecretKind::Header(HeaderSecret { headers: data }),
            _ => SecretKind::Generic(GenericSecret { data }),
        }
    };

    let mut secret = Secret::new(&reference.name, SecretSpec { kind });
    secret.metadata.namespace = Some(reference.namespace);
    secret.metadata.labels = kube_secret.metadata.labels.clone();
    secret.metadata.resource_version = kube_secret.metadata.resource_version.clone();
    Ok(secret)
}

fn decode_data(
    data: Option<&BTreeMap<String, ByteString>>,
    reference: &ResourceRef,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (key, value) in data.into_iter().flatten() {
        let value = String::from_utf8(value.0.clone()).map_err(|_| {
            SecretError::Decode(reference.clone(), format!("key {} is not UTF-8", key))
        })?;
        out.insert(key.clone(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kube_secret(type_: &str, annotations: &[(&str, &str)], data: &[(&str, &str)]) -> KubeSecret {
        let mut secret = KubeSecret::default();
        secret.metadata.name = Some("creds".into());
        secret.metadata.namespace = Some("default".into());
        secret.type_ = Some(type_.into());
        secret.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        secret.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        secret
    }

    #[test]
    fn test_convert_tls() {
        let secret = convert(&kube_secret(
            TLS_TYPE,
            &[],
            &[("tls.crt", "CERT"), ("tls.key", "KEY")],
        ))
        .unwrap();
        let tls = secret.spec.kind.as_tls().unwrap();
        assert_eq!(tls.cert_chain, "CERT");
        assert_eq!(tls.private_key, "KEY");
        assert_eq!(tls.root_ca, "");
        assert_eq!(secret.metadata.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_convert_annotated() {
        let secret = convert(&kube_secret(
            "Opaque",
            &[(KIND_ANNOTATION, "oauth")],
            &[("client-secret", "s3cr3t")],
        ))
        .unwrap();
        assert_eq!(
            secret.spec.kind,
            SecretKind::Oauth(OauthSecret {
                client_secret: "s3cr3t".into()
            })
        );

        let err = convert(&kube_secret("Opaque", &[(KIND_ANNOTATION, "oauth")], &[])).unwrap_err();
        assert!(matches!(err, SecretError::Decode(_, _)));

        let secret = convert(&kube_secret("Opaque", &[], &[("k", "v")])).unwrap();
        assert!(matches!(secret.spec.kind, SecretKind::Generic(_)));
    }
}
