use anyhow::Result;
use edge_core::logging;
use edge_core::settings::parse_default;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

mod server;
mod sink;

use sink::TelemetrySink;

const BIND_ADDR: &str = "EDGE_TELEMETRY_ADDR";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    info!("Starting edge-telemetry...");

    let bind_addr: String = parse_default(BIND_ADDR, "0.0.0.0:9966".to_string())?;
    let sink = Arc::new(TelemetrySink::new()?);
    let listener = TcpListener::bind(&bind_addr).await?;

    tokio::select! {
        result = server::serve(listener, sink) => {
            if let Err(e) = result {
                error!("Telemetry server error: {}", e);
                return Err(e);
            }
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, exiting...");
        }
    }

    Ok(())
}
