//! # DHT Node Runtime
//!
//! Wires a master peer, its children and the handshake RPC together.
//!
//! ## Startup Sequence
//!
//! 1. Create the master peer (address discovery, listeners, shared transport)
//! 2. Attach the configured number of child peers
//! 3. Register the handshake RPC for every peer and track reachability on
//!    the master
//! 4. Bootstrap against the configured seed addresses
//! 5. Start liveness checks on the master
//!
//! Shutdown is the master's cascading shutdown.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod metrics_server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use dht_connection::PeerCreator;
use dht_rpc::{HandshakeRpc, PeerTracker};
use dht_types::PeerId;

pub use config::{ConfigError, NodeConfig};
pub use metrics_server::MetricsServer;

pub struct NodeRuntime {
    master: PeerCreator,
    children: Vec<PeerCreator>,
    handshake: Arc<HandshakeRpc>,
    tracker: Arc<PeerTracker>,
}

impl NodeRuntime {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let master = PeerCreator::master(config.peer.clone(), None)
            .await
            .context("Failed to create master peer")?;

        let tracker = Arc::new(PeerTracker::new());
        master.peer_bean().status_listeners().add(tracker.clone());
        let handshake = attach_rpc(&master)?;

        let mut children = Vec::with_capacity(config.children);
        for _ in 0..config.children {
            let child = master
                .child(PeerId::random(), None)
                .context("Failed to attach child peer")?;
            attach_rpc(&child)?;
            children.push(child);
        }

        let runtime = Self {
            master,
            children,
            handshake,
            tracker,
        };
        let reached = runtime.bootstrap(&config.bootstrap).await;
        if !config.bootstrap.is_empty() && reached == 0 {
            warn!(seeds = config.bootstrap.len(), "No bootstrap peer answered");
        }

        runtime
            .handshake
            .start_liveness_checks(Arc::clone(&runtime.tracker), config.liveness_interval)
            .context("Failed to start liveness checks")?;

        info!(
            peer = %runtime.master.peer_bean().server_address(),
            children = runtime.children.len(),
            "Node started"
        );
        Ok(runtime)
    }

    /// Ping every seed; returns how many answered.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> usize {
        let mut reached = 0;
        for &seed in seeds {
            match self.handshake.bootstrap(seed).await {
                Ok(peer) => {
                    reached += 1;
                    // learn how the seed sees us
                    if let Err(error) = self.handshake.discover(&peer).await {
                        warn!(%seed, %error, "Discover failed");
                    }
                }
                Err(error) => warn!(%seed, %error, "Bootstrap failed"),
            }
        }
        reached
    }

    pub fn master(&self) -> &PeerCreator {
        &self.master
    }

    pub fn children(&self) -> &[PeerCreator] {
        &self.children
    }

    pub fn tracker(&self) -> &Arc<PeerTracker> {
        &self.tracker
    }

    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.master.shutdown().await;
        info!("Shutdown complete");
    }
}

fn attach_rpc(peer: &PeerCreator) -> Result<Arc<HandshakeRpc>> {
    let handshake = HandshakeRpc::new(peer);
    handshake
        .register()
        .with_context(|| format!("Failed to register handshake for {:?}", peer.peer_id()))?;
    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dht_connection::PeerConfig;

    fn config() -> NodeConfig {
        NodeConfig {
            peer: PeerConfig::for_testing(),
            children: 2,
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_two_nodes_bootstrap_and_shutdown() {
        let seed = NodeRuntime::start(config()).await.unwrap();
        let seed_addr = seed.master().connection_bean().channel_server().udp_addr();

        let node = NodeRuntime::start(NodeConfig {
            bootstrap: vec![seed_addr],
            ..config()
        })
        .await
        .unwrap();

        assert!(node.tracker().is_reachable(&seed.master().peer_id()));
        assert!(seed.tracker().is_reachable(&node.master().peer_id()));
        assert_eq!(node.children().len(), 2);

        node.shutdown().await;
        seed.shutdown().await;
        assert!(node.children().iter().all(PeerCreator::is_shut_down));
    }
}
