//! Upstream clusters and their hosts
//!
//! A [`ClusterManager`] holds one [`UpstreamCluster`] per cluster in the
//! current snapshot. Hosts keep their health across snapshot updates as long
//! as their address stays in the assignment.

use crate::error::ProxyError;
use crate::failover::PrioritySelector;
use crate::health_check::HealthCheckMonitor;
use crate::load_balancer::LoadBalancer;
use crate::metrics::MetricsCollector;
use crate::transcoder::Transcoder;
use crate::Result;
use edge_api::v1::options::{Locality, OutlierDetection};
use edge_api::xds::{
    Cluster, ClusterKind, ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints, Snapshot, UpstreamTls,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Host {
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub priority: u32,
    pub locality: Locality,
    pub locality_weight: Option<u32>,
    pub health_check_path: Option<String>,
    /// Endpoint TLS that takes precedence over the cluster's
    pub tls: Option<UpstreamTls>,
    healthy: AtomicBool,
    active_requests: AtomicUsize,
    consecutive_5xx: AtomicU32,
    ejected_until: Mutex<Option<Instant>>,
}

impl Host {
    /// A healthy priority 0 host with weight 1
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            weight: 1,
            priority: 0,
            locality: Locality::default(),
            locality_weight: None,
            health_check_path: None,
            tls: None,
            healthy: AtomicBool::new(true),
            active_requests: AtomicUsize::new(0),
            consecutive_5xx: AtomicU32::new(0),
            ejected_until: Mutex::new(None),
        }
    }

    pub fn from_endpoint(endpoint: &LbEndpoint, group: &LocalityLbEndpoints) -> Self {
        let mut host = Self::new(&endpoint.address, endpoint.port);
        host.weight = endpoint.weight.max(1);
        host.priority = group.priority;
        host.locality = group.locality.clone();
        host.locality_weight = group.load_balancing_weight;
        host.health_check_path = endpoint.health_check_path.clone();
        host.tls = endpoint.tls.clone();
        host
    }

    /// `address:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Passing active checks and not ejected by outlier detection
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && !self.is_ejected()
    }

    /// Result of active checks alone, ignoring outlier ejection
    pub fn is_active_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Returns the previous active health state
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn is_ejected(&self) -> bool {
        let mut ejected = self.ejected_until.lock().unwrap_or_else(|e| e.into_inner());
        match *ejected {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                *ejected = None;
                false
            }
            None => false,
        }
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn start_request(self: &Arc<Self>) -> RequestGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        RequestGuard { host: self.clone() }
    }

    /// Feed a response status into outlier detection
    pub fn record_response(&self, status: u16, outlier: Option<&OutlierDetection>) {
        if status < 500 {
            self.consecutive_5xx.store(0, Ordering::Relaxed);
            return;
        }
        let Some(outlier) = outlier else {
            return;
        };
        let failures = self.consecutive_5xx.fetch_add(1, Ordering::Relaxed) + 1;
        if outlier.consecutive_5xx > 0 && failures >= outlier.consecutive_5xx {
            self.consecutive_5xx.store(0, Ordering::Relaxed);
            let until = Instant::now() + Duration::from_millis(outlier.base_ejection_time_ms);
            *self.ejected_until.lock().unwrap_or_else(|e| e.into_inner()) = Some(until);
            warn!(host = %self.authority(), failures, "Ejecting host after consecutive 5xx");
        }
    }

    fn inherit_state(&self, previous: &Host) {
        self.healthy
            .store(previous.healthy.load(Ordering::Acquire), Ordering::Release);
        let ejected = *previous.ejected_until.lock().unwrap_or_else(|e| e.into_inner());
        *self.ejected_until.lock().unwrap_or_else(|e| e.into_inner()) = ejected;
    }
}

/// Decrements the host's active request count when dropped
pub struct RequestGuard {
    host: Arc<Host>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.host.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct UpstreamCluster {
    pub config: Cluster,
    assignment: ClusterLoadAssignment,
    hosts: Vec<Arc<Host>>,
    selector: PrioritySelector,
    lb: LoadBalancer,
    monitor: Option<HealthCheckMonitor>,
    transcoder: Option<Arc<Transcoder>>,
}

impl UpstreamCluster {
    /// Build a cluster, carrying host health over from `previous`
    pub fn new(
        config: Cluster,
        assignment: ClusterLoadAssignment,
        previous: Option<&UpstreamCluster>,
    ) -> Self {
        let known: HashMap<String, &Arc<Host>> = previous
            .map(|p| p.hosts.iter().map(|h| (h.authority(), h)).collect())
            .unwrap_or_default();

        let hosts: Vec<Arc<Host>> = assignment
            .endpoints
            .iter()
            .flat_map(|group| {
                group
                    .lb_endpoints
                    .iter()
                    .map(move |endpoint| Host::from_endpoint(endpoint, group))
            })
            .map(|host| {
                if let Some(previous) = known.get(&host.authority()) {
                    host.inherit_state(previous);
                }
                Arc::new(host)
            })
            .collect();

        let selector = PrioritySelector::new(&hosts, &config.lb);
        let lb = LoadBalancer::new(config.lb.policy.clone());
        let transcoder = config.grpc_json_transcoder.as_ref().and_then(|t| match Transcoder::new(t) {
            Ok(transcoder) => Some(Arc::new(transcoder)),
            Err(e) => {
                warn!(cluster = %config.name, error = %e, "Ignoring gRPC JSON transcoder");
                None
            }
        });
        Self {
            config,
            assignment,
            hosts,
            selector,
            lb,
            monitor: None,
            transcoder,
        }
    }

    /// Start active health checks when the cluster configures any
    pub fn start_health_checks(&mut self, metrics: Option<MetricsCollector>) {
        if let Some(check) = self.config.health_checks.first() {
            self.monitor = Some(HealthCheckMonitor::start(
                &self.config.name,
                self.hosts.clone(),
                check,
                metrics,
            ));
        }
    }

    pub fn transcoder(&self) -> Option<&Arc<Transcoder>> {
        self.transcoder.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn is_forward_proxy(&self) -> bool {
        self.config.kind == ClusterKind::DynamicForwardProxy
    }

    pub fn is_health_checked(&self) -> bool {
        self.monitor.is_some()
    }

    pub fn priorities(&self) -> Vec<u32> {
        self.selector.priorities()
    }

    pub fn healthy_host_count(&self) -> usize {
        self.hosts.iter().filter(|h| h.is_healthy()).count()
    }

    pub fn select_host(&self, hash_key: Option<&str>) -> Result<Arc<Host>> {
        self.select_host_with_panic(hash_key).map(|(host, _)| host)
    }

    /// Select a host; the flag is set when selection fell into panic mode
    pub fn select_host_with_panic(&self, hash_key: Option<&str>) -> Result<(Arc<Host>, bool)> {
        let selection = self
            .selector
            .select(&self.lb, hash_key)
            .ok_or_else(|| ProxyError::NoHealthyUpstream(self.config.name.clone()))?;
        if selection.panic {
            debug!(cluster = %self.config.name, "No healthy hosts, selecting in panic mode");
        }
        Ok((selection.host, selection.panic))
    }

    pub fn record_response(&self, host: &Host, status: u16) {
        host.record_response(status, self.config.outlier_detection.as_ref());
    }

    fn unchanged(&self, config: &Cluster, assignment: &ClusterLoadAssignment) -> bool {
        self.config == *config && self.assignment == *assignment
    }
}

/// Host for a dynamic forward proxy request, taken from the authority
pub fn forward_proxy_host(authority: &str) -> Option<Arc<Host>> {
    let uri: hyper::Uri = format!("http://{}", authority).parse().ok()?;
    let host = uri.host()?.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some(Arc::new(Host::new(host, uri.port_u16().unwrap_or(80))))
}

/// Live clusters of the current snapshot
pub struct ClusterManager {
    clusters: RwLock<HashMap<String, Arc<UpstreamCluster>>>,
    metrics: Option<MetricsCollector>,
}

impl ClusterManager {
    pub fn new(metrics: Option<MetricsCollector>) -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Apply a snapshot's clusters. Unchanged clusters are kept as they are;
    /// changed ones are rebuilt and restart their health checks.
    pub async fn update(&self, snapshot: &Snapshot) {
        let mut clusters = self.clusters.write().await;
        let mut next = HashMap::with_capacity(snapshot.clusters.len());

        for config in &snapshot.clusters {
            let assignment = snapshot
                .load_assignment(&config.name)
                .cloned()
                .unwrap_or_else(|| ClusterLoadAssignment {
                    cluster_name: config.name.clone(),
                    endpoints: Vec::new(),
                });

            let previous = clusters.get(&config.name);
            if let Some(existing) = previous.filter(|c| c.unchanged(config, &assignment)) {
                next.insert(config.name.clone(), existing.clone());
                continue;
            }

            let mut cluster =
                UpstreamCluster::new(config.clone(), assignment, previous.map(|c| c.as_ref()));
            cluster.start_health_checks(self.metrics.clone());
            debug!(cluster = %config.name, hosts = cluster.hosts().len(), "Cluster updated");
            next.insert(config.name.clone(), Arc::new(cluster));
        }

        for removed in clusters.keys().filter(|name| !next.contains_key(*name)) {
            debug!(cluster = %removed, "Cluster removed");
        }
        info!(clusters = next.len(), version = %snapshot.version, "Applied clusters");
        *clusters = next;
    }

    pub async fn get(&self, name: &str) -> Option<Arc<UpstreamCluster>> {
        self.clusters.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(priority: u32, addresses: &[&str]) -> LocalityLbEndpoints {
        LocalityLbEndpoints {
            locality: Locality {
                region: format!("region-{}", priority),
                ..Default::default()
            },
            priority,
            load_balancing_weight: None,
            lb_endpoints: addresses.iter().map(|a| LbEndpoint::new(*a, 8080)).collect(),
        }
    }

    fn cluster(name: &str) -> Cluster {
        Cluster {
            name: name.into(),
            kind: ClusterKind::Eds,
            ..Default::default()
        }
    }

    fn snapshot(version: &str, groups: Vec<LocalityLbEndpoints>) -> Snapshot {
        Snapshot {
            version: version.into(),
            clusters: vec![cluster("backend_default")],
            cluster_load_assignments: vec![ClusterLoadAssignment {
                cluster_name: "backend_default".into(),
                endpoints: groups,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_host_authority() {
        assert_eq!(Host::new("10.0.0.1", 80).authority(), "10.0.0.1:80");
        assert_eq!(Host::new("::1", 8443).authority(), "[::1]:8443");
    }

    #[test]
    fn test_request_guard() {
        let host = Arc::new(Host::new("10.0.0.1", 80));
        let first = host.start_request();
        let second = host.start_request();
        assert_eq!(host.active_requests(), 2);
        drop(first);
        assert_eq!(host.active_requests(), 1);
        drop(second);
        assert_eq!(host.active_requests(), 0);
    }

    #[test]
    fn test_outlier_ejection() {
        let host = Host::new("10.0.0.1", 80);
        let outlier = OutlierDetection {
            consecutive_5xx: 2,
            ..Default::default()
        };
        host.record_response(503, Some(&outlier));
        host.record_response(200, Some(&outlier));
        host.record_response(503, Some(&outlier));
        assert!(host.is_healthy());
        host.record_response(502, Some(&outlier));
        assert!(!host.is_healthy());
        assert!(host.is_ejected());

        // 5xx are ignored without outlier detection
        let other = Host::new("10.0.0.2", 80);
        for _ in 0..10 {
            other.record_response(500, None);
        }
        assert!(other.is_healthy());
    }

    #[test]
    fn test_fails_over_to_next_priority() {
        let cluster = UpstreamCluster::new(
            cluster("backend_default"),
            ClusterLoadAssignment {
                cluster_name: "backend_default".into(),
                endpoints: vec![group(0, &["10.0.0.1"]), group(1, &["10.0.1.1"])],
            },
            None,
        );
        assert_eq!(cluster.select_host(None).unwrap().address, "10.0.0.1");

        cluster.hosts()[0].set_healthy(false);
        let (host, panic) = cluster.select_host_with_panic(None).unwrap();
        assert_eq!(host.address, "10.0.1.1");
        assert_eq!(host.priority, 1);
        assert!(!panic);

        cluster.hosts()[1].set_healthy(false);
        let (host, panic) = cluster.select_host_with_panic(None).unwrap();
        assert_eq!(host.address, "10.0.0.1");
        assert!(panic);
        assert_eq!(cluster.healthy_host_count(), 0);
    }

    #[test]
    fn test_empty_cluster_has_no_healthy_upstream() {
        let cluster = UpstreamCluster::new(cluster("empty"), ClusterLoadAssignment::default(), None);
        assert!(matches!(
            cluster.select_host(None),
            Err(ProxyError::NoHealthyUpstream(name)) if name == "empty"
        ));
    }

    #[test]
    fn test_transcoder_built_from_config() {
        let mut config = cluster("bookstore_default");
        config.grpc_json_transcoder = Some(crate::transcoder::tests::bookstore_config());
        let built = UpstreamCluster::new(config.clone(), ClusterLoadAssignment::default(), None);
        assert!(built
            .transcoder()
            .and_then(|t| t.method(&hyper::Method::POST, "/bookstore.Bookstore/GetShelf"))
            .is_some());

        // a descriptor that does not decode leaves the cluster plain
        if let Some(transcoder) = config.grpc_json_transcoder.as_mut() {
            transcoder.proto_descriptor_bin = Some("AAAA".into());
        }
        let plain = UpstreamCluster::new(config, ClusterLoadAssignment::default(), None);
        assert!(plain.transcoder().is_none());
    }

    #[test]
    fn test_forward_proxy_host() {
        let host = forward_proxy_host("example.com").unwrap();
        assert_eq!(host.authority(), "example.com:80");
        let host = forward_proxy_host("[::1]:9000").unwrap();
        assert_eq!(host.authority(), "[::1]:9000");
        assert!(forward_proxy_host("").is_none());
    }

    #[tokio::test]
    async fn test_manager_keeps_health_across_updates() {
        let manager = ClusterManager::new(None);
        manager
            .update(&snapshot("v1", vec![group(0, &["10.0.0.1", "10.0.0.2"])]))
            .await;
        let first = manager.get("backend_default").await.unwrap();
        first.hosts()[0].set_healthy(false);

        // same config and endpoints: cluster is reused
        manager
            .update(&snapshot("v2", vec![group(0, &["10.0.0.1", "10.0.0.2"])]))
            .await;
        let second = manager.get("backend_default").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // endpoints changed: rebuilt, surviving host keeps its state
        manager
            .update(&snapshot("v3", vec![group(0, &["10.0.0.1", "10.0.0.3"])]))
            .await;
        let third = manager.get("backend_default").await.unwrap();
        assert!(!Arc::ptr_eq(&second, &third));
        let health: Vec<(String, bool)> = third
            .hosts()
            .iter()
            .map(|h| (h.address.clone(), h.is_healthy()))
            .collect();
        assert_eq!(
            health,
            vec![("10.0.0.1".to_string(), false), ("10.0.0.3".to_string(), true)]
        );

        manager.update(&Snapshot::default()).await;
        assert!(manager.get("backend_default").await.is_none());
        assert!(manager.names().await.is_empty());
    }
}
