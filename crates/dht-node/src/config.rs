//! Node configuration.
//!
//! Loaded from a TOML file, then overridden from the environment.
//!
//! ```toml
//! [network]
//! p2p_id = 1
//! peer_id = "4f3c...e1"        # optional, 40 hex chars
//! children = 2
//! liveness_interval_secs = 60
//!
//! [bootstrap]
//! nodes = ["10.0.0.1:7700", "10.0.0.2:7700"]
//!
//! [server]
//! bind_ip = "0.0.0.0"
//! tcp_port = 7700
//! udp_port = 7700
//! heartbeat_ms = 30000
//!
//! [client]
//! max_in_use_channels = 64
//! request_timeout_ms = 5000
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use dht_connection::{ChannelClientConfig, ChannelServerConfig, PeerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {error}")]
    Io { path: String, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    network: NetworkSection,
    #[serde(default)]
    bootstrap: BootstrapSection,
    #[serde(default)]
    server: ChannelServerConfig,
    #[serde(default)]
    client: ChannelClientConfig,
}

#[derive(Debug, Deserialize, Default)]
struct NetworkSection {
    p2p_id: Option<i32>,
    peer_id: Option<String>,
    children: Option<usize>,
    liveness_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BootstrapSection {
    #[serde(default)]
    nodes: Vec<String>,
}

/// Everything the node needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub peer: PeerConfig,
    /// Child peers sharing the master's transport.
    pub children: usize,
    pub bootstrap: Vec<SocketAddr>,
    pub liveness_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            children: 0,
            bootstrap: Vec::new(),
            liveness_interval: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let defaults = Self::default();

        let bootstrap = file
            .bootstrap
            .nodes
            .iter()
            .filter_map(|node| match node.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(node = %node, "Ignoring malformed bootstrap address");
                    None
                }
            })
            .collect();

        let network = file.network;
        Ok(Self {
            peer: PeerConfig {
                p2p_id: network.p2p_id.unwrap_or(defaults.peer.p2p_id),
                peer_id: network.peer_id,
                server: file.server,
                client: file.client,
            },
            children: network.children.unwrap_or(defaults.children),
            bootstrap,
            liveness_interval: network
                .liveness_interval_secs
                .map_or(defaults.liveness_interval, Duration::from_secs),
        })
    }

    /// Apply `DHT_PORT`, `DHT_P2P_ID` and `DHT_BOOTSTRAP` (comma separated).
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("DHT_PORT").and_then(|p| p.parse().ok()) {
            self.peer = self.peer.clone().with_port(port);
            info!(port, "Port overridden from environment");
        }
        if let Some(p2p_id) = lookup("DHT_P2P_ID").and_then(|p| p.parse().ok()) {
            self.peer.p2p_id = p2p_id;
        }
        if let Some(nodes) = lookup("DHT_BOOTSTRAP") {
            self.bootstrap = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .filter_map(|n| n.parse().ok())
                .collect();
        }
    }
}
