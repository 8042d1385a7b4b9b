//! Resource clients for the configured source
//!
//! Kubernetes-backed clients, or a directory of YAML manifests loaded into
//! in-memory clients once at startup.

use anyhow::{anyhow, bail, Context, Result};
use edge_api::{Gateway, Proxy, Secret, Upstream, VirtualService};
use edge_core::settings::{ResourceSource, SecretSourceSettings};
use edge_core::{
    ClientResource, KubeResourceClient, MemoryResourceClient, ResourceClient, Settings, WriteOpts,
};
use edge_secrets::{
    KubernetesSecretSource, MemorySecretSource, MultiSecretSource, SecretSource, VaultSecretSource,
};
use edge_translator::Clients;
use kube::{Resource, ResourceExt};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory clients for every kind a manifest can hold
#[derive(Clone, Default)]
pub struct MemoryClients {
    pub gateways: MemoryResourceClient<Gateway>,
    pub virtual_services: MemoryResourceClient<VirtualService>,
    pub upstreams: MemoryResourceClient<Upstream>,
    pub proxies: MemoryResourceClient<Proxy>,
    pub secrets: MemoryResourceClient<Secret>,
}

/// Clients for the configured resource source, and the Kubernetes client
/// when there is one
pub async fn build_clients(settings: &Settings) -> Result<(Clients, Option<kube::Client>)> {
    match &settings.resource_source {
        ResourceSource::Kubernetes => {
            let client = kube::Client::try_default()
                .await
                .context("failed to create Kubernetes client")?;
            let secrets = secret_sources(settings, Some(&client), None)?;
            let clients = Clients {
                gateways: Arc::new(KubeResourceClient::<Gateway>::new(client.clone())),
                virtual_services: Arc::new(KubeResourceClient::<VirtualService>::new(client.clone())),
                upstreams: Arc::new(KubeResourceClient::<Upstream>::new(client.clone())),
                proxies: Arc::new(KubeResourceClient::<Proxy>::new(client.clone())),
                secrets,
            };
            info!("Using Kubernetes resource clients");
            Ok((clients, Some(client)))
        }
        ResourceSource::Directory { path } => {
            let memory = MemoryClients::default();
            let loaded = load_directory(Path::new(path), &settings.write_namespace, &memory).await?;
            info!(path = %path, resources = loaded, "Loaded resource manifests");
            let secrets = secret_sources(settings, None, Some(&memory.secrets))?;
            let clients = Clients {
                gateways: Arc::new(memory.gateways),
                virtual_services: Arc::new(memory.virtual_services),
                upstreams: Arc::new(memory.upstreams),
                proxies: Arc::new(memory.proxies),
                secrets,
            };
            Ok((clients, None))
        }
    }
}

fn secret_sources(
    settings: &Settings,
    kube_client: Option<&kube::Client>,
    memory: Option<&MemoryResourceClient<Secret>>,
) -> Result<Arc<dyn SecretSource>> {
    let mut sources: Vec<Arc<dyn SecretSource>> = Vec::new();
    for source in &settings.secret_sources {
        match source {
            SecretSourceSettings::Kubernetes => match kube_client {
                Some(client) => sources.push(Arc::new(KubernetesSecretSource::new(client.clone()))),
                None => debug!("Skipping Kubernetes secret source without a cluster"),
            },
            SecretSourceSettings::Memory => sources.push(Arc::new(MemorySecretSource::new(
                memory.cloned().unwrap_or_default(),
            ))),
            SecretSourceSettings::Vault(vault) => sources.push(Arc::new(VaultSecretSource::new(vault))),
        }
    }
    // manifests are the only place directory-mode secrets can come from
    if sources.is_empty() {
        match memory {
            Some(memory) => sources.push(Arc::new(MemorySecretSource::new(memory.clone()))),
            None => bail!("no usable secret source configured"),
        }
    }
    Ok(Arc::new(MultiSecretSource::new(sources)))
}

/// Load every `.yaml`/`.yml` file under `dir`, returning how many resources
/// were written
pub async fn load_directory(dir: &Path, default_namespace: &str, clients: &MemoryClients) -> Result<usize> {
    let mut paths = Vec::new();
    collect_manifests(dir, &mut paths)?;
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        loaded += load_manifests(&raw, default_namespace, clients)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    Ok(loaded)
}

fn collect_manifests(dir: &Path, paths: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_manifests(&path, paths)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            paths.push(path);
        }
    }
    Ok(())
}

/// Load a multi-document YAML string
pub async fn load_manifests(raw: &str, default_namespace: &str, clients: &MemoryClients) -> Result<usize> {
    let mut loaded = 0;
    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| anyhow!("manifest without a kind"))?
            .to_string();
        match kind.as_str() {
            "Gateway" => write(&clients.gateways, value, default_namespace).await?,
            "VirtualService" => write(&clients.virtual_services, value, default_namespace).await?,
            "Upstream" => write(&clients.upstreams, value, default_namespace).await?,
            "Proxy" => write(&clients.proxies, value, default_namespace).await?,
            "Secret" => write(&clients.secrets, value, default_namespace).await?,
            other => bail!("unsupported kind {}", other),
        }
        loaded += 1;
    }
    Ok(loaded)
}

async fn write<K: ClientResource>(
    client: &MemoryResourceClient<K>,
    value: serde_yaml::Value,
    default_namespace: &str,
) -> Result<()> {
    let mut resource: K = serde_yaml::with::singleton_map_recursive::deserialize(value)?;
    if resource.namespace().is_none() {
        resource.meta_mut().namespace = Some(default_namespace.to_string());
    }
    debug!(
        kind = %client.kind(),
        namespace = %resource.namespace().unwrap_or_default(),
        name = %resource.name_any(),
        "Loaded manifest"
    );
    client.write(resource, WriteOpts::overwrite()).await?;
    Ok(())
}
