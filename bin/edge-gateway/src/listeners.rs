//! Applies discovery snapshots to the running listeners
//!
//! Listeners are matched by name. A listener whose new configuration fails to
//! build keeps serving its previous state; one that disappears from the
//! snapshot is shut down.

use edge_api::xds::{Listener, Snapshot};
use edge_proxy::{serve, ListenerState, SharedRuntime};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

struct RunningListener {
    bind: (String, u16),
    local_addr: SocketAddr,
    state: watch::Sender<Arc<ListenerState>>,
    shutdown: watch::Sender<bool>,
}

impl RunningListener {
    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Result of applying one snapshot
#[derive(Debug, Default, PartialEq)]
pub struct ApplySummary {
    pub started: usize,
    pub updated: usize,
    pub stopped: usize,
    pub failed: usize,
}

pub struct ListenerManager {
    runtime: SharedRuntime,
    listeners: HashMap<String, RunningListener>,
}

impl ListenerManager {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self {
            runtime,
            listeners: HashMap::new(),
        }
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners.get(name).map(|l| l.local_addr)
    }

    pub async fn apply(&mut self, snapshot: &Snapshot) -> ApplySummary {
        let mut summary = ApplySummary::default();
        self.runtime.clusters.update(snapshot).await;

        for listener in &snapshot.listeners {
            let state = match ListenerState::build(listener, snapshot, &self.runtime) {
                Ok(state) => Arc::new(state),
                Err(e) => {
                    warn!(listener = %listener.name, version = %snapshot.version, error = %e, "Rejected listener configuration, keeping previous");
                    summary.failed += 1;
                    continue;
                }
            };

            let bind = (listener.address.clone(), listener.port);
            match self.listeners.get(&listener.name) {
                Some(running) if running.bind == bind => {
                    running.state.send_replace(state);
                    summary.updated += 1;
                    continue;
                }
                Some(running) => {
                    info!(listener = %listener.name, "Listener address changed, rebinding");
                    running.stop();
                }
                None => {}
            }

            match self.start(listener, state).await {
                Ok(running) => {
                    self.listeners.insert(listener.name.clone(), running);
                    summary.started += 1;
                }
                Err(e) => {
                    self.listeners.remove(&listener.name);
                    error!(listener = %listener.name, address = %listener.address, port = listener.port, error = %e, "Failed to bind listener");
                    summary.failed += 1;
                }
            }
        }

        let stale: Vec<String> = self
            .listeners
            .keys()
            .filter(|name| !snapshot.listeners.iter().any(|l| &l.name == *name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(running) = self.listeners.remove(&name) {
                info!(listener = %name, "Stopping listener");
                running.stop();
                summary.stopped += 1;
            }
        }

        info!(
            version = %snapshot.version,
            started = summary.started,
            updated = summary.updated,
            stopped = summary.stopped,
            failed = summary.failed,
            "Applied snapshot"
        );
        summary
    }

    async fn start(&self, listener: &Listener, state: Arc<ListenerState>) -> std::io::Result<RunningListener> {
        let socket = TcpListener::bind((listener.address.as_str(), listener.port)).await?;
        let local_addr = socket.local_addr()?;
        let (state_tx, state_rx) = watch::channel(state);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let name = listener.name.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(socket, state_rx, shutdown_rx).await {
                error!(listener = %name, error = %e, "Listener failed");
            }
        });

        Ok(RunningListener {
            bind: (listener.address.clone(), listener.port),
            local_addr,
            state: state_tx,
            shutdown: shutdown_tx,
        })
    }

    pub fn shutdown(&mut self) {
        for (_, running) in self.listeners.drain() {
            running.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::proxy::{DirectResponseAction, Matcher};
    use edge_api::xds::{
        EnvoyAction, EnvoyRoute, EnvoyVirtualHost, FilterChain, HttpConnectionManager, NetworkFilter,
        RouteConfiguration, RoutePolicies,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn snapshot(version: &str, body: &str, route_config: &str) -> Snapshot {
        Snapshot {
            version: version.into(),
            listeners: vec![Listener {
                name: "http".into(),
                address: "127.0.0.1".into(),
                port: 0,
                filter_chains: vec![FilterChain {
                    name: "http".into(),
                    filter: NetworkFilter::HttpConnectionManager(HttpConnectionManager {
                        route_config_name: route_config.into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            route_configurations: vec![RouteConfiguration {
                name: "http-routes".into(),
                virtual_hosts: vec![EnvoyVirtualHost {
                    name: "default.hello".into(),
                    domains: vec!["*".into()],
                    routes: vec![EnvoyRoute {
                        name: "hello".into(),
                        matcher: Matcher::prefix("/"),
                        action: EnvoyAction::DirectResponse(DirectResponseAction {
                            status: 200,
                            body: body.into(),
                        }),
                        policies: RoutePolicies::default(),
                    }],
                }],
            }],
            ..Default::default()
        }
    }

    async fn get(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_start_update_stop() {
        let mut manager = ListenerManager::new(SharedRuntime::new(None, None));

        let summary = manager.apply(&snapshot("v1", "first", "http-routes")).await;
        assert_eq!(summary.started, 1);
        let addr = manager.local_addr("http").unwrap();
        assert!(get(addr).await.ends_with("first\n"));

        let summary = manager.apply(&snapshot("v2", "second", "http-routes")).await;
        assert_eq!(summary.updated, 1);
        assert_eq!(manager.local_addr("http"), Some(addr));
        assert!(get(addr).await.ends_with("second\n"));

        // a broken update keeps the previous state
        let summary = manager.apply(&snapshot("v3", "third", "missing-routes")).await;
        assert_eq!(summary.failed, 1);
        assert!(get(addr).await.ends_with("second\n"));

        let summary = manager
            .apply(&Snapshot {
                version: "v4".into(),
                ..Default::default()
            })
            .await;
        assert_eq!(summary.stopped, 1);
        assert!(manager.local_addr("http").is_none());
    }
}
