//! # Peer Creator
//!
//! Composition root for logical peers.
//!
//! A master peer owns the transport: it discovers its address, starts the
//! channel server and builds the shared [`ConnectionBean`]. Child peers reuse
//! the master's `ConnectionBean` and only get their own [`PeerBean`], with an
//! address that differs from the master's only in its peer id.
//!
//! ## Peer tree
//!
//! Peers live in one arena per transport. Nodes refer to their parent and
//! children by index, so the tree holds no reference cycles.
//!
//! ## Shutdown
//!
//! ```text
//! shutdown(peer)
//!   1. remove (peer, peer) handlers from the dispatcher
//!   2. stop the peer's maintenance task
//!   3. shutdown(child) for every child, depth first
//!   4. master only: timer ─► reservation ─► channel server
//! ```
//!
//! Each node runs this once; concurrent and repeated calls wait for the first
//! run and return. A failing step is logged and the sequence goes on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use dht_telemetry::log_peer_event;
use dht_types::{KeyPair, PeerAddress, PeerId, PeerSocketAddress};

use crate::channel_server::ChannelServer;
use crate::config::PeerConfig;
use crate::connection_bean::ConnectionBean;
use crate::discovery::discover_address;
use crate::dispatcher::Dispatcher;
use crate::error::ConnectionError;
use crate::peer_bean::PeerBean;
use crate::peer_status::PeerStatusListeners;
use crate::reservation::Reservation;
use crate::sender::Sender;
use crate::timer::Timer;

type ShutdownFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

struct PeerNode {
    peer_bean: Arc<PeerBean>,
    parent: Option<usize>,
    children: Vec<usize>,
    closing: bool,
    shutdown: Arc<OnceCell<()>>,
}

#[derive(Default)]
struct PeerTree {
    nodes: Mutex<Vec<PeerNode>>,
}

impl PeerTree {
    fn insert(&self, peer_bean: Arc<PeerBean>, parent: Option<usize>) -> Result<usize, ConnectionError> {
        let mut nodes = self.nodes.lock();
        if let Some(parent) = parent {
            if nodes.get(parent).map_or(true, |node| node.closing) {
                return Err(ConnectionError::Shutdown);
            }
        }
        let index = nodes.len();
        nodes.push(PeerNode {
            peer_bean,
            parent,
            children: Vec::new(),
            closing: false,
            shutdown: Arc::new(OnceCell::new()),
        });
        if let Some(parent) = parent {
            nodes[parent].children.push(index);
        }
        Ok(index)
    }
}

/// Handle to one logical peer. Clones refer to the same peer.
#[derive(Clone)]
pub struct PeerCreator {
    index: usize,
    tree: Arc<PeerTree>,
    connection_bean: Arc<ConnectionBean>,
    peer_bean: Arc<PeerBean>,
}

impl PeerCreator {
    /// Build a master peer and its transport.
    ///
    /// The peer id is taken from `config.peer_id`, else derived from
    /// `key_pair`, else random. Fails before anything is bound if no usable
    /// address is found, and releases everything if binding fails.
    pub async fn master(config: PeerConfig, key_pair: Option<KeyPair>) -> Result<Self, ConnectionError> {
        let peer_id = match (&config.peer_id, &key_pair) {
            (Some(hex), _) => PeerId::from_hex(hex)?,
            (None, Some(key_pair)) => key_pair.peer_id(),
            (None, None) => PeerId::random(),
        };
        let ip = discover_address(&config.server)?;

        let listeners = PeerStatusListeners::new();
        let dispatcher = Arc::new(Dispatcher::new(config.p2p_id, peer_id));
        let channel_server = ChannelServer::start(
            &config.server,
            config.p2p_id,
            Arc::clone(&dispatcher),
            listeners.clone(),
        )
        .await?;

        let reservation = Reservation::new(config.client.clone(), config.p2p_id);
        let sender = Arc::new(Sender::new(reservation, listeners.clone()));
        let socket = PeerSocketAddress::new(
            ip,
            channel_server.tcp_addr().port(),
            channel_server.udp_addr().port(),
        );
        let firewalled = config.server.behind_firewall;
        let address = PeerAddress::new(peer_id, socket).change_firewalled(firewalled, firewalled);

        let connection_bean = Arc::new(ConnectionBean::new(
            config.p2p_id,
            dispatcher,
            sender,
            channel_server,
            Arc::new(Timer::new()),
        ));
        let peer_bean = Arc::new(PeerBean::new(peer_id, key_pair, address.clone()).with_status_listeners(listeners));

        let tree = Arc::new(PeerTree::default());
        let index = tree.insert(Arc::clone(&peer_bean), None)?;
        log_peer_event!(info, "peer", "Master peer created", peer_id, %address, p2p_id = config.p2p_id);

        Ok(Self {
            index,
            tree,
            connection_bean,
            peer_bean,
        })
    }

    /// Attach a child peer sharing this peer's transport.
    ///
    /// Fails with `Shutdown` once this peer has begun shutting down.
    pub fn child(&self, peer_id: PeerId, key_pair: Option<KeyPair>) -> Result<Self, ConnectionError> {
        let address = self.peer_bean.server_address().change_peer_id(peer_id);
        let peer_bean = Arc::new(PeerBean::new(peer_id, key_pair, address));
        let index = self.tree.insert(Arc::clone(&peer_bean), Some(self.index))?;
        log_peer_event!(debug, "peer", "Child peer attached", peer_id, parent = %self.peer_id());

        Ok(Self {
            index,
            tree: Arc::clone(&self.tree),
            connection_bean: Arc::clone(&self.connection_bean),
            peer_bean,
        })
    }

    pub fn is_master(&self) -> bool {
        self.tree.nodes.lock()[self.index].parent.is_none()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_bean.peer_id()
    }

    pub fn peer_bean(&self) -> &Arc<PeerBean> {
        &self.peer_bean
    }

    pub fn connection_bean(&self) -> &Arc<ConnectionBean> {
        &self.connection_bean
    }

    /// Direct children, in attach order.
    pub fn children(&self) -> Vec<PeerCreator> {
        let nodes = self.tree.nodes.lock();
        nodes[self.index]
            .children
            .iter()
            .map(|&index| self.handle(index, &nodes[index]))
            .collect()
    }

    fn handle(&self, index: usize, node: &PeerNode) -> PeerCreator {
        PeerCreator {
            index,
            tree: Arc::clone(&self.tree),
            connection_bean: Arc::clone(&self.connection_bean),
            peer_bean: Arc::clone(&node.peer_bean),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.tree.nodes.lock()[self.index].shutdown.initialized()
    }

    /// Shut this peer and its descendants down. Resolves once every step
    /// has run; later calls return immediately.
    pub async fn shutdown(&self) {
        let done = Arc::clone(&self.tree.nodes.lock()[self.index].shutdown);
        done.get_or_init(|| self.shutdown_steps()).await;
    }

    fn shutdown_steps(&self) -> ShutdownFuture<'_> {
        Box::pin(async move {
            let peer_id = self.peer_id();
            let (is_master, children) = {
                let mut nodes = self.tree.nodes.lock();
                nodes[self.index].closing = true;
                let node = &nodes[self.index];
                let children: Vec<PeerCreator> = node
                    .children
                    .iter()
                    .map(|&index| self.handle(index, &nodes[index]))
                    .collect();
                (node.parent.is_none(), children)
            };
            debug!(peer = ?peer_id, master = is_master, children = children.len(), "Peer shutting down");

            if !self.connection_bean.dispatcher().remove_io_handlers(peer_id, peer_id) {
                debug!(peer = ?peer_id, "No handlers were registered");
            }
            if self.peer_bean.stop_maintenance() {
                debug!(peer = ?peer_id, "Maintenance task stopped");
            }
            for child in &children {
                child.shutdown().await;
            }

            if is_master {
                self.release_transport().await;
            }
            log_peer_event!(info, "peer", "Peer shut down", peer_id, master = is_master);
        })
    }

    async fn release_transport(&self) {
        let bean = &self.connection_bean;
        bean.timer().shutdown();

        bean.reservation().shutdown().await;
        bean.channel_server().shutdown().await;
    }
}

impl std::fmt::Debug for PeerCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCreator")
            .field("index", &self.index)
            .field("peer", &self.peer_bean)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use dht_wire::{Command, Message, MessageType};

    use crate::error::DispatchError;
    use crate::handler::DispatchHandler;
    use crate::maintenance::MaintenanceTask;

    struct Ack;

    #[async_trait]
    impl DispatchHandler for Ack {
        fn name(&self) -> &str {
            "ack"
        }

        async fn handle_request(&self, request: &Message) -> Result<Message, DispatchError> {
            Ok(Message::response_to(request, MessageType::Ok))
        }
    }

    fn register(peer: &PeerCreator) {
        let id = peer.peer_id();
        peer.connection_bean()
            .dispatcher()
            .register_io_handler(id, id, Arc::new(Ack), &[Command::Ping.code()])
            .unwrap();
    }

    #[tokio::test]
    async fn test_master_address_uses_bound_ports() {
        let master = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        let address = master.peer_bean().server_address();
        let server = master.connection_bean().channel_server();
        assert_eq!(address.tcp_addr().port(), server.tcp_addr().port());
        assert_eq!(address.udp_addr().port(), server.udp_addr().port());
        assert_eq!(address.peer_id(), master.peer_id());
        assert!(master.is_master());
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_id_from_config_or_key_pair() {
        let id = PeerId::random();
        let config = PeerConfig {
            peer_id: Some(id.to_hex()),
            ..PeerConfig::for_testing()
        };
        let master = PeerCreator::master(config, None).await.unwrap();
        assert_eq!(master.peer_id(), id);
        master.shutdown().await;

        let key_pair = KeyPair::generate();
        let expected = key_pair.peer_id();
        let master = PeerCreator::master(PeerConfig::for_testing(), Some(key_pair)).await.unwrap();
        assert_eq!(master.peer_id(), expected);
        assert!(master.peer_bean().key_pair().is_some());
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_peer_id_aborts_creation() {
        let config = PeerConfig {
            peer_id: Some("not hex".into()),
            ..PeerConfig::for_testing()
        };
        let result = PeerCreator::master(config, None).await;
        assert!(matches!(result, Err(ConnectionError::Identity(_))));
    }

    #[tokio::test]
    async fn test_port_in_use_aborts_creation() {
        let first = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        let port = first.connection_bean().channel_server().udp_addr().port();
        let result = PeerCreator::master(PeerConfig::for_testing().with_port(port), None).await;
        assert!(matches!(result, Err(ConnectionError::Bind { .. })));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_child_shares_transport() {
        let master = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        let child = master.child(PeerId::random(), None).unwrap();

        assert!(!child.is_master());
        assert!(Arc::ptr_eq(master.connection_bean(), child.connection_bean()));
        let (m, c) = (master.peer_bean().server_address(), child.peer_bean().server_address());
        assert_eq!(m.socket(), c.socket());
        assert_ne!(m.peer_id(), c.peer_id());
        assert_eq!(master.children().len(), 1);
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_child_shutdown_leaves_transport_running() {
        let master = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        let child = master.child(PeerId::random(), None).unwrap();
        let grandchild = child.child(PeerId::random(), None).unwrap();
        register(&master);
        register(&child);
        register(&grandchild);

        child.shutdown().await;
        child.shutdown().await;

        let keys = master.connection_bean().dispatcher().registered_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].owner, master.peer_id());
        assert!(grandchild.is_shut_down());
        assert!(!master.is_shut_down());
        assert!(!master.connection_bean().channel_server().is_shut_down());
        assert!(!master.connection_bean().timer().is_shut_down());
        assert!(matches!(child.child(PeerId::random(), None), Err(ConnectionError::Shutdown)));

        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_master_shutdown_cascades_once() {
        let master = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        let children: Vec<_> = (0..2).map(|_| master.child(PeerId::random(), None).unwrap()).collect();
        register(&master);
        for child in &children {
            register(child);
            let task = MaintenanceTask::start(
                master.connection_bean().timer(),
                "refresh",
                Duration::from_secs(60),
                || async {},
            )
            .unwrap();
            child.peer_bean().set_maintenance_task(task);
        }

        tokio::join!(master.shutdown(), children[0].shutdown(), master.shutdown());

        let bean = master.connection_bean();
        assert!(bean.dispatcher().registered_keys().is_empty());
        assert!(children.iter().all(|c| c.is_shut_down() && !c.peer_bean().has_maintenance_task()));
        assert!(bean.timer().is_shut_down());
        assert!(bean.reservation().is_shut_down());
        assert!(bean.channel_server().is_shut_down());
        assert!(matches!(master.child(PeerId::random(), None), Err(ConnectionError::Shutdown)));
    }
}
