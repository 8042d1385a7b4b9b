//! Active health checking of cluster hosts

use crate::cluster::Host;
use crate::metrics::MetricsCollector;
use edge_api::v1::options::health_check::HttpHealthCheck;
use edge_api::v1::options::{HealthCheck, HealthCheckKind};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{header, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runs single checks against a host
#[derive(Clone)]
pub struct HealthChecker {
    config: HealthCheck,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheck) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build_http();
        Self { config, client }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.max(1))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms.max(1))
    }

    /// Check a host once; timeouts and errors count as failures
    pub async fn check(&self, host: &Host) -> bool {
        let check = async {
            match &self.config.kind {
                HealthCheckKind::Http(http) => self.check_http(host, http).await,
                // gRPC health checks are approximated by a TCP connect
                HealthCheckKind::Tcp | HealthCheckKind::Grpc(_) => self.check_tcp(host).await,
            }
        };
        match time::timeout(self.timeout(), check).await {
            Ok(Ok(())) => {
                debug!(host = %host.authority(), "Health check passed");
                true
            }
            Ok(Err(reason)) => {
                debug!(host = %host.authority(), reason = %reason, "Health check failed");
                false
            }
            Err(_) => {
                debug!(host = %host.authority(), "Health check timed out");
                false
            }
        }
    }

    async fn check_tcp(&self, host: &Host) -> Result<(), String> {
        tokio::net::TcpStream::connect(host.authority())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn check_http(&self, host: &Host, http: &HttpHealthCheck) -> Result<(), String> {
        let authority = host.authority();
        let path = host.health_check_path.as_deref().unwrap_or(&http.path);
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let request = Request::builder()
            .uri(format!("http://{}{}", authority, path))
            .header(header::HOST, http.host.as_deref().unwrap_or(&authority))
            .header(header::USER_AGENT, HEALTH_CHECK_USER_AGENT)
            .body(Empty::<Bytes>::new())
            .map_err(|e| e.to_string())?;

        let response = self.client.request(request).await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let expected = if http.expected_statuses.is_empty() {
            &[200][..]
        } else {
            &http.expected_statuses[..]
        };
        if expected.contains(&status) {
            Ok(())
        } else {
            Err(format!("unexpected status {}", status))
        }
    }
}

/// User agent of health check requests; access logs can filter on it
pub const HEALTH_CHECK_USER_AGENT: &str = "Envoy/HC";

/// Consecutive results needed to flip a host's health
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthState {
    consecutive_successes: u32,
    consecutive_failures: u32,
    healthy: bool,
}

impl HealthState {
    pub fn new(healthy: bool) -> Self {
        Self {
            consecutive_successes: 0,
            consecutive_failures: 0,
            healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Record a result; returns the new health when it changed
    pub fn record(&mut self, success: bool, healthy_threshold: u32, unhealthy_threshold: u32) -> Option<bool> {
        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if !self.healthy && self.consecutive_successes >= healthy_threshold.max(1) {
                self.healthy = true;
                return Some(true);
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.healthy && self.consecutive_failures >= unhealthy_threshold.max(1) {
                self.healthy = false;
                return Some(false);
            }
        }
        None
    }
}

/// Periodic checks of every host of one cluster
pub struct HealthCheckMonitor {
    tasks: Vec<JoinHandle<()>>,
}

impl HealthCheckMonitor {
    /// Spawn one check loop per host. Must be called within a tokio runtime.
    pub fn start(
        cluster: &str,
        hosts: Vec<Arc<Host>>,
        config: &HealthCheck,
        metrics: Option<MetricsCollector>,
    ) -> Self {
        let checker = HealthChecker::new(config.clone());
        let tasks = hosts
            .into_iter()
            .map(|host| {
                let checker = checker.clone();
                let cluster = cluster.to_string();
                let metrics = metrics.clone();
                let (healthy_threshold, unhealthy_threshold) =
                    (config.healthy_threshold, config.unhealthy_threshold);
                tokio::spawn(async move {
                    let mut state = HealthState::new(host.is_active_healthy());
                    let mut interval = time::interval(checker.interval());
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        let success = checker.check(&host).await;
                        let Some(healthy) = state.record(success, healthy_threshold, unhealthy_threshold)
                        else {
                            continue;
                        };
                        host.set_healthy(healthy);
                        if healthy {
                            info!(cluster = %cluster, host = %host.authority(), "Host became healthy");
                        } else {
                            warn!(cluster = %cluster, host = %host.authority(), "Host became unhealthy");
                        }
                        if let Some(metrics) = &metrics {
                            metrics.record_health_transition(&cluster, healthy);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        debug!(cluster = %cluster, hosts = tasks.len(), "Health checks started");
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for HealthCheckMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
