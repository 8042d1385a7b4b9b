use anyhow::Result;
use edge_core::logging;
use edge_proxy::{MetricsCollector, MetricsStreamer, SharedRuntime};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

mod admin;
mod config;
mod discovery;
mod listeners;

use admin::AdminServer;
use config::GatewayConfig;
use discovery::DiscoveryClient;
use listeners::ListenerManager;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    info!("Starting edge-gateway...");

    let config = GatewayConfig::from_env()?;
    info!(node = %config.node_id, controller = %config.controller_addr, "Gateway configured");

    let metrics = MetricsCollector::new()?;
    let runtime = SharedRuntime::new(Some(metrics.clone()), config.als_addr.clone());
    let mut manager = ListenerManager::new(runtime);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (snapshot_tx, snapshot_rx) = watch::channel(None);

    let admin = Arc::new(AdminServer::new(
        metrics.clone(),
        manager.runtime().clusters.clone(),
        snapshot_rx,
    ));
    let admin_listener = TcpListener::bind(&config.admin_addr).await?;
    tokio::spawn(admin.serve(admin_listener, shutdown_rx.clone()));

    match &config.als_addr {
        Some(als_addr) => {
            let streamer = MetricsStreamer::new(metrics, als_addr, &config.node_id, config.metrics_interval);
            tokio::spawn(streamer.run(shutdown_rx.clone()));
            info!("Streaming metrics to {}", als_addr);
        }
        None => info!("No telemetry service configured, metrics streaming disabled"),
    }

    let discovery = DiscoveryClient::new(&config.controller_addr, &config.node_id)?;
    let mut version: Option<String> = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Shutdown signal received, exiting...");
                break;
            }
            fetched = discovery.fetch(version.as_deref()) => match fetched {
                Ok(Some(snapshot)) => {
                    info!(version = %snapshot.version, listeners = snapshot.listeners.len(), "Received configuration");
                    manager.apply(&snapshot).await;
                    version = Some(snapshot.version.clone());
                    snapshot_tx.send_replace(Some(Arc::new(snapshot)));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Discovery request failed");
                    tokio::time::sleep(config.retry_interval).await;
                }
            }
        }
    }

    manager.shutdown();
    let _ = shutdown_tx.send(true);
    Ok(())
}
