use anyhow::Result;
use edge_core::{logging, EndpointRegistry, Settings};
use edge_translator::{SnapshotCache, TranslatorMetrics, TranslatorSyncer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

mod discovery;
mod endpoints;
mod resources;

use discovery::DiscoveryServer;
use endpoints::EndpointDiscovery;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    info!("Starting edge-controller...");

    let settings = Settings::load()?;
    let (clients, kube_client) = resources::build_clients(&settings).await?;

    let registry = EndpointRegistry::new();
    let cache = SnapshotCache::new();
    let metrics = TranslatorMetrics::new()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(client) = kube_client {
        let discovery = EndpointDiscovery::new(client, clients.upstreams.clone(), registry.clone());
        tokio::spawn(discovery.run());
    } else {
        info!("No Kubernetes client, endpoint discovery disabled");
    }

    let syncer = Arc::new(TranslatorSyncer::new(
        clients,
        settings.clone(),
        registry,
        cache.clone(),
        metrics.clone(),
    ));
    let syncer_task = tokio::spawn(syncer.run(wait_for(shutdown_rx.clone())));

    let listener = TcpListener::bind(&settings.xds_bind_addr).await?;
    let server = Arc::new(DiscoveryServer::new(cache, metrics));
    let server_task = tokio::spawn(server.serve(listener, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");
    let _ = shutdown_tx.send(true);

    if let Ok(Err(e)) = server_task.await {
        error!("Discovery server error: {}", e);
    }
    let _ = syncer_task.await;

    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
