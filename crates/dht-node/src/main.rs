//! # DHT Node
//!
//! ```text
//! dht-node [config.toml]
//! ```
//!
//! Without a path, `DHT_CONFIG` is used; without either, defaults apply.
//! `DHT_PORT`, `DHT_P2P_ID` and `DHT_BOOTSTRAP` override the file.
//! Metrics are served on `DHT_METRICS_PORT` (default 9100).

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use tracing::{info, warn};

use dht_node::{MetricsServer, NodeConfig, NodeRuntime};
use dht_telemetry::{init_telemetry, TelemetryConfig};

fn load_config() -> Result<NodeConfig> {
    let path = std::env::args().nth(1).or_else(|| std::env::var("DHT_CONFIG").ok());
    let mut config = match path {
        Some(path) => {
            NodeConfig::load(&path).with_context(|| format!("Failed to load configuration from {path}"))?
        }
        None => NodeConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry_config = TelemetryConfig::from_env();
    let metrics_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, telemetry_config.metrics_port));
    let _telemetry = init_telemetry(telemetry_config).context("Failed to initialize telemetry")?;

    // bind failure is not fatal
    let metrics = match MetricsServer::start(metrics_addr).await {
        Ok(server) => Some(server),
        Err(error) => {
            warn!(%metrics_addr, %error, "Metrics endpoint unavailable");
            None
        }
    };

    let config = load_config()?;
    let runtime = NodeRuntime::start(config).await?;

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown().await;
    if let Some(server) = metrics {
        server.shutdown().await;
    }
    Ok(())
}
