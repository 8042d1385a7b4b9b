//! Translation loop
//!
//! Watches every input kind and the endpoint registry. On change it rebuilds
//! the API snapshot, generates and reconciles gateway proxies, compiles every
//! proxy into the snapshot cache and writes a terminal status to every
//! Gateway, VirtualService, Upstream and Proxy it read.

use crate::cache::SnapshotCache;
use crate::gateway::{GatewayTranslator, GeneratedProxy};
use crate::metrics::TranslatorMetrics;
use crate::plugins::Params;
use crate::reporter::ProxySources;
use crate::translator::{ProxyTranslator, TranslatorOptions};
use crate::Result;
use edge_api::v1::{CREATED_BY_LABEL, CREATED_BY_VALUE};
use edge_api::xds::node_id;
use edge_api::{Gateway, HasStatus, Proxy, ResourceRef, StatusState, Upstream, VirtualService};
use edge_core::client::list_namespaces;
use edge_core::{
    ApiSnapshot, ClientResource, DeleteOpts, Endpoint, EndpointRegistry, ResourceKind, ResourceReports,
    Settings, StatusClient, WriteOpts,
};
use edge_secrets::SecretSource;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Written to `status.reportedBy`
pub const REPORTER: &str = "edge-controller";

/// Secrets have no change feed, so the loop also syncs on this period
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Clients for every kind the translator reads
#[derive(Clone)]
pub struct Clients {
    pub gateways: Arc<dyn StatusClient<Gateway>>,
    pub virtual_services: Arc<dyn StatusClient<VirtualService>>,
    pub upstreams: Arc<dyn StatusClient<Upstream>>,
    pub proxies: Arc<dyn StatusClient<Proxy>>,
    pub secrets: Arc<dyn SecretSource>,
}

/// Outcome of one sync
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncSummary {
    /// Proxies translated, user-written and generated
    pub proxies: usize,
    /// Nodes whose cached snapshot changed
    pub snapshots_updated: usize,
    /// Proxies with errors; their nodes keep the last good snapshot
    pub rejected_proxies: Vec<ResourceRef>,
    pub statuses_written: usize,
}

pub struct TranslatorSyncer {
    clients: Clients,
    settings: Settings,
    registry: EndpointRegistry,
    cache: SnapshotCache,
    gateway_translator: GatewayTranslator,
    proxy_translator: ProxyTranslator,
    metrics: TranslatorMetrics,
}

impl TranslatorSyncer {
    pub fn new(
        clients: Clients,
        settings: Settings,
        registry: EndpointRegistry,
        cache: SnapshotCache,
        metrics: TranslatorMetrics,
    ) -> Self {
        Self {
            gateway_translator: GatewayTranslator::new(&settings),
            proxy_translator: ProxyTranslator::new(TranslatorOptions::from(&settings.gateway)),
            clients,
            settings,
            registry,
            cache,
            metrics,
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn metrics(&self) -> &TranslatorMetrics {
        &self.metrics
    }

    /// Watched namespaces plus the write namespace; empty means all
    fn namespaces(&self) -> Vec<String> {
        let mut namespaces = self.settings.watch_namespaces.clone();
        if !namespaces.is_empty() && !namespaces.contains(&self.settings.write_namespace) {
            namespaces.push(self.settings.write_namespace.clone());
        }
        namespaces
    }

    pub async fn build_snapshot(&self) -> Result<ApiSnapshot> {
        let namespaces = self.namespaces();

        let secrets = if namespaces.is_empty() {
            self.clients.secrets.list(None).await?
        } else {
            let mut secrets = Vec::new();
            for ns in &namespaces {
                secrets.extend(self.clients.secrets.list(Some(ns)).await?);
            }
            secrets
        };

        Ok(ApiSnapshot {
            gateways: list_namespaces(self.clients.gateways.as_ref(), &namespaces).await?,
            virtual_services: list_namespaces(self.clients.virtual_services.as_ref(), &namespaces).await?,
            upstreams: list_namespaces(self.clients.upstreams.as_ref(), &namespaces).await?,
            proxies: list_namespaces(self.clients.proxies.as_ref(), &namespaces).await?,
            secrets,
        })
    }

    /// Read everything and sync once
    pub async fn resync(&self) -> Result<SyncSummary> {
        let snapshot = self.build_snapshot().await?;
        self.sync(&snapshot).await
    }

    pub async fn sync(&self, snapshot: &ApiSnapshot) -> Result<SyncSummary> {
        let mut reports = ResourceReports::new();
        let mut summary = SyncSummary::default();

        let generated = self.gateway_translator.translate(snapshot, &mut reports);
        let stored_generated = self.reconcile_generated(snapshot, &generated).await?;

        let endpoints = self.registry.snapshot().await;
        let params = Params::new(snapshot, &endpoints);
        let upstreams = self.proxy_translator.translate_upstreams(&params, &mut reports);

        let mut targets: Vec<(&Proxy, Option<&ProxySources>)> = snapshot
            .proxies
            .iter()
            .filter(|p| !is_generated(p))
            .map(|p| (p, None))
            .collect();
        targets.extend(generated.iter().map(|g| (&g.proxy, Some(&g.sources))));

        let mut nodes = HashSet::new();
        for (proxy, sources) in targets {
            let reference = ResourceRef::of(proxy);
            let compiled = self
                .proxy_translator
                .translate_proxy(&params, proxy, &upstreams, sources, &mut reports);
            let node = node_id(&reference.namespace, &reference.name);
            summary.proxies += 1;

            if reports.has_errors(ResourceKind::Proxy, &reference) {
                warn!(proxy = %reference, "Proxy rejected, keeping last good snapshot");
                summary.rejected_proxies.push(reference);
            } else if self.cache.set_snapshot(&node, compiled).await {
                summary.snapshots_updated += 1;
            }
            nodes.insert(node);
        }

        for node in self.cache.nodes().await {
            if !nodes.contains(&node) {
                self.cache.clear(&node).await;
            }
        }
        self.metrics.proxies.set(self.cache.nodes().await.len() as i64);

        let mut proxies: Vec<Proxy> = snapshot.proxies.iter().filter(|p| !is_generated(p)).cloned().collect();
        proxies.extend(stored_generated);

        let mut written = 0;
        written += self
            .write_statuses(self.clients.gateways.as_ref(), ResourceKind::Gateway, &snapshot.gateways, &reports)
            .await?;
        written += self
            .write_statuses(
                self.clients.virtual_services.as_ref(),
                ResourceKind::VirtualService,
                &snapshot.virtual_services,
                &reports,
            )
            .await?;
        written += self
            .write_statuses(self.clients.upstreams.as_ref(), ResourceKind::Upstream, &snapshot.upstreams, &reports)
            .await?;
        written += self
            .write_statuses(self.clients.proxies.as_ref(), ResourceKind::Proxy, &proxies, &reports)
            .await?;
        summary.statuses_written = written;

        self.metrics.syncs_total.inc();
        Ok(summary)
    }

    /// Write generated proxies whose spec changed and delete the ones no
    /// Gateway produces anymore, returning the stored copies
    async fn reconcile_generated(&self, snapshot: &ApiSnapshot, generated: &[GeneratedProxy]) -> Result<Vec<Proxy>> {
        let existing: BTreeMap<ResourceRef, &Proxy> = snapshot
            .proxies
            .iter()
            .filter(|p| is_generated(p))
            .map(|p| (ResourceRef::of(p), p))
            .collect();

        let mut stored = Vec::with_capacity(generated.len());
        for desired in generated {
            let reference = desired.reference();
            match existing.get(&reference) {
                Some(current) if same_spec(current, &desired.proxy) => stored.push((*current).clone()),
                _ => {
                    let written = self
                        .clients
                        .proxies
                        .write(desired.proxy.clone(), WriteOpts::overwrite())
                        .await?;
                    info!(proxy = %reference, "Wrote generated proxy");
                    stored.push(written);
                }
            }
        }

        let wanted: HashSet<ResourceRef> = generated.iter().map(|g| g.reference()).collect();
        for reference in existing.keys() {
            if reference.namespace != self.settings.write_namespace || wanted.contains(reference) {
                continue;
            }
            self.clients
                .proxies
                .delete(
                    &reference.namespace,
                    &reference.name,
                    DeleteOpts {
                        ignore_not_exist: true,
                    },
                )
                .await?;
            info!(proxy = %reference, "Deleted stale generated proxy");
        }
        Ok(stored)
    }

    async fn write_statuses<K>(
        &self,
        client: &dyn StatusClient<K>,
        kind: ResourceKind,
        resources: &[K],
        reports: &ResourceReports,
    ) -> Result<usize>
    where
        K: ClientResource + HasStatus,
    {
        let mut written = 0;
        let mut states = Vec::with_capacity(resources.len());

        for resource in resources {
            let reference = ResourceRef::of(resource);
            let mut status = reports.status_for(kind, &reference).reported_by(REPORTER);
            status.observed_generation = resource.meta().generation;
            states.push(status.state);

            if resource.status() == Some(&status) {
                continue;
            }
            if status.state == StatusState::Rejected {
                debug!(kind = %kind, resource = %reference, reason = ?status.reason, "Resource rejected");
            }
            match client.apply_status(&reference.namespace, &reference.name, status).await {
                Ok(_) => written += 1,
                // Deleted since the snapshot was taken
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.metrics.record_states(kind, &states);
        Ok(written)
    }

    /// Sync on every change until `shutdown` resolves
    ///
    /// Bursts of changes within the refresh rate collapse into one sync, and
    /// a sync is skipped when neither resources nor endpoints changed.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let mut changes = stream::select_all(vec![
            self.clients.gateways.subscribe(),
            self.clients.virtual_services.subscribe(),
            self.clients.upstreams.subscribe(),
            self.clients.proxies.subscribe(),
            registry_changes(self.registry.subscribe()),
        ]);
        let mut resync = tokio::time::interval(RESYNC_INTERVAL);
        let mut last_hash: Option<String> = None;
        tokio::pin!(shutdown);

        info!(
            write_namespace = %self.settings.write_namespace,
            refresh_rate_ms = self.settings.refresh_rate_ms,
            "Starting translator syncer"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Translator syncer stopped");
                    return;
                }
                _ = resync.tick() => {}
                Some(()) = changes.next() => {
                    tokio::time::sleep(self.settings.refresh_rate()).await;
                    while let Some(Some(())) = changes.next().now_or_never() {}
                }
            }
            self.sync_if_changed(&mut last_hash).await;
        }
    }

    async fn sync_if_changed(&self, last_hash: &mut Option<String>) {
        let snapshot = match self.build_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Failed to read resources");
                self.metrics.sync_failures_total.inc();
                return;
            }
        };
        let endpoints = self.registry.snapshot().await;
        let hash = input_hash(&snapshot, &endpoints);
        // a rewrite with an unchanged spec still needs its status reported
        if last_hash.as_deref() == Some(hash.as_str()) && snapshot.converged() {
            debug!("Inputs unchanged, skipping sync");
            self.metrics.syncs_skipped_total.inc();
            return;
        }

        match self.sync(&snapshot).await {
            Ok(summary) => {
                info!(
                    proxies = summary.proxies,
                    snapshots_updated = summary.snapshots_updated,
                    rejected = summary.rejected_proxies.len(),
                    statuses_written = summary.statuses_written,
                    "Sync complete"
                );
                *last_hash = Some(hash);
            }
            Err(e) => {
                error!(error = %e, "Sync failed");
                self.metrics.sync_failures_total.inc();
            }
        }
    }
}

pub fn is_generated(proxy: &Proxy) -> bool {
    proxy.labels().get(CREATED_BY_LABEL).map(String::as_str) == Some(CREATED_BY_VALUE)
}

fn same_spec(a: &Proxy, b: &Proxy) -> bool {
    a.labels() == b.labels()
        && serde_json::to_value(&a.spec).ok() == serde_json::to_value(&b.spec).ok()
}

fn registry_changes(rx: broadcast::Receiver<()>) -> BoxStream<'static, ()> {
    stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), rx)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
    .boxed()
}

/// Resource hash combined with the discovered endpoints
fn input_hash(snapshot: &ApiSnapshot, endpoints: &HashMap<String, Vec<Endpoint>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.hash().as_bytes());
    let sorted: BTreeMap<&String, &Vec<Endpoint>> = endpoints.iter().collect();
    for (key, eps) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(serde_json::to_vec(eps).unwrap_or_default());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{http_gateway, route_to, static_upstream, virtual_service};
    use edge_api::v1::proxy::{HttpListener, Listener, ListenerType, ProxySpec, VirtualHost};
    use edge_api::Secret;
    use edge_core::{MemoryResourceClient, ResourceClient};
    use edge_secrets::MemorySecretSource;

    struct Harness {
        gateways: MemoryResourceClient<Gateway>,
        virtual_services: MemoryResourceClient<VirtualService>,
        upstreams: MemoryResourceClient<Upstream>,
        proxies: MemoryResourceClient<Proxy>,
        registry: EndpointRegistry,
        syncer: Arc<TranslatorSyncer>,
    }

    fn harness() -> Harness {
        let gateways = MemoryResourceClient::new();
        let virtual_services = MemoryResourceClient::new();
        let upstreams = MemoryResourceClient::new();
        let proxies = MemoryResourceClient::new();
        let registry = EndpointRegistry::new();
        let clients = Clients {
            gateways: Arc::new(gateways.clone()),
            virtual_services: Arc::new(virtual_services.clone()),
            upstreams: Arc::new(upstreams.clone()),
            proxies: Arc::new(proxies.clone()),
            secrets: Arc::new(MemorySecretSource::new(MemoryResourceClient::<Secret>::new())),
        };
        let settings = Settings {
            refresh_rate_ms: 10,
            ..Default::default()
        };
        let syncer = TranslatorSyncer::new(
            clients,
            settings,
            registry.clone(),
            SnapshotCache::new(),
            TranslatorMetrics::new().unwrap(),
        );
        Harness {
            gateways,
            virtual_services,
            upstreams,
            proxies,
            registry,
            syncer: Arc::new(syncer),
        }
    }

    async fn seed(h: &Harness) {
        h.upstreams
            .write(static_upstream("default", "petstore", "10.0.0.1", 8080), WriteOpts::default())
            .await
            .unwrap();
        h.virtual_services
            .write(
                virtual_service("default", "petstore", &["petstore.example.com"], vec![route_to("/", "petstore")]),
                WriteOpts::default(),
            )
            .await
            .unwrap();
        h.gateways
            .write(http_gateway("edge-system", "gw", 8080), WriteOpts::default())
            .await
            .unwrap();
    }

    fn user_proxy(ports: &[u16]) -> Proxy {
        let listeners = ports
            .iter()
            .enumerate()
            .map(|(i, port)| Listener {
                name: format!("http-{}", i),
                bind_address: "::".into(),
                bind_port: *port,
                listener_type: ListenerType::Http(HttpListener {
                    virtual_hosts: vec![VirtualHost {
                        name: format!("vh-{}", i),
                        domains: vec![format!("host-{}.example.com", i)],
                        routes: vec![route_to("/", "petstore")],
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        let mut proxy = Proxy::new("manual", ProxySpec { listeners });
        proxy.metadata.namespace = Some("default".into());
        proxy
    }

    #[tokio::test]
    async fn test_every_write_reaches_terminal_status() {
        let h = harness();
        seed(&h).await;

        let summary = h.syncer.resync().await.unwrap();
        assert_eq!(summary.proxies, 1);
        assert!(summary.rejected_proxies.is_empty());

        let gw = h.gateways.read("edge-system", "gw").await.unwrap();
        let vs = h.virtual_services.read("default", "petstore").await.unwrap();
        let us = h.upstreams.read("default", "petstore").await.unwrap();
        let proxy = h.proxies.read("edge-system", "gateway-proxy").await.unwrap();
        for state in [gw.state(), vs.state(), us.state(), proxy.state()] {
            assert_eq!(state, StatusState::Accepted);
        }
        let status = gw.status.unwrap();
        assert_eq!(status.reported_by.as_deref(), Some(REPORTER));
        assert_eq!(status.observed_generation, Some(1));
        assert!(is_generated(&proxy));

        let snapshot = h.syncer.cache().snapshot("edge-system~gateway-proxy").await.unwrap();
        assert!(snapshot.cluster("petstore_default").is_some());

        // Converged: nothing left to write
        let again = h.syncer.resync().await.unwrap();
        assert_eq!(again.statuses_written, 0);
        assert_eq!(again.snapshots_updated, 0);
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_reported_again() {
        let h = harness();
        seed(&h).await;
        let mut last_hash = None;
        h.syncer.sync_if_changed(&mut last_hash).await;
        assert!(last_hash.is_some());

        let vs = h.virtual_services.read("default", "petstore").await.unwrap();
        assert_eq!(vs.state(), StatusState::Accepted);
        h.virtual_services.write(vs, WriteOpts::overwrite()).await.unwrap();

        h.syncer.sync_if_changed(&mut last_hash).await;
        let vs = h.virtual_services.read("default", "petstore").await.unwrap();
        let status = vs.status.clone().unwrap();
        assert_eq!(status.state, StatusState::Accepted);
        assert_eq!(status.observed_generation, vs.metadata.generation);
    }

    #[tokio::test]
    async fn test_duplicate_bind_address_rejected() {
        let h = harness();
        seed(&h).await;
        h.gateways
            .write(http_gateway("edge-system", "gw-2", 8080), WriteOpts::default())
            .await
            .unwrap();

        let summary = h.syncer.resync().await.unwrap();
        assert_eq!(summary.rejected_proxies.len(), 1);

        for name in ["gw", "gw-2"] {
            let gw = h.gateways.read("edge-system", name).await.unwrap();
            let status = gw.status.unwrap();
            assert_eq!(status.state, StatusState::Rejected);
            assert!(!status.reason.unwrap_or_default().is_empty());
        }
        let proxy = h.proxies.read("edge-system", "gateway-proxy").await.unwrap();
        assert_eq!(proxy.state(), StatusState::Rejected);
        assert!(h.syncer.cache().snapshot("edge-system~gateway-proxy").await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_proxy_keeps_last_good_snapshot() {
        let h = harness();
        seed(&h).await;
        h.proxies.write(user_proxy(&[9090]), WriteOpts::default()).await.unwrap();
        h.syncer.resync().await.unwrap();
        let good = h.syncer.cache().snapshot("default~manual").await.unwrap();

        h.proxies
            .write(user_proxy(&[9090, 9090]), WriteOpts::overwrite())
            .await
            .unwrap();
        let summary = h.syncer.resync().await.unwrap();
        assert_eq!(summary.rejected_proxies, vec![ResourceRef::new("default", "manual")]);

        let proxy = h.proxies.read("default", "manual").await.unwrap();
        let status = proxy.status.unwrap();
        assert_eq!(status.state, StatusState::Rejected);
        assert!(status.reason.unwrap().contains("duplicate bind address :::9090"));
        assert_eq!(status.observed_generation, Some(2));
        let kept = h.syncer.cache().snapshot("default~manual").await.unwrap();
        assert_eq!(kept.version, good.version);
    }

    #[tokio::test]
    async fn test_stale_generated_proxy_removed() {
        let h = harness();
        seed(&h).await;
        h.syncer.resync().await.unwrap();
        assert_eq!(h.proxies.len().await, 1);

        h.gateways
            .delete("edge-system", "gw", DeleteOpts::default())
            .await
            .unwrap();
        h.syncer.resync().await.unwrap();
        assert!(h.proxies.is_empty().await);
        assert!(h.syncer.cache().nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_reacts_to_changes() {
        let h = harness();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(h.syncer.clone().run(async move {
            let _ = stopped.await;
        }));

        seed(&h).await;
        let mut accepted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(gw) = h.gateways.read("edge-system", "gw").await {
                if gw.state().is_terminal() {
                    accepted = gw.state() == StatusState::Accepted;
                    break;
                }
            }
        }
        assert!(accepted);

        h.registry
            .update_endpoints(&ResourceRef::new("default", "petstore"), vec![Endpoint::new("10.0.0.2", 8080)])
            .await;
        let mut discovered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let snapshot = h.syncer.cache().snapshot("edge-system~gateway-proxy").await;
            if let Some(assignment) = snapshot.as_ref().and_then(|s| s.load_assignment("petstore_default").cloned()) {
                if assignment.endpoints.iter().flat_map(|e| &e.lb_endpoints).any(|e| e.address == "10.0.0.2") {
                    discovered = true;
                    break;
                }
            }
        }
        assert!(discovered);

        stop.send(()).unwrap();
        task.await.unwrap();
    }
}
