//! # Handshake RPC
//!
//! Liveness and address discovery over `Command::Ping`.
//!
//! | Kind | Meaning | Answer |
//! |------|---------|--------|
//! | `Request1` | ping | `Ok` |
//! | `Request2` | discover | `Ok`, payload = requester address as seen by the responder |
//! | `RequestFf1` | fire-and-forget ping | none |
//!
//! Every answer carries the responder's own address as sender, which is how
//! a bootstrap learns the peer id behind a bare `ip:port`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use dht_connection::{
    ConnectionBean, ConnectionError, DispatchError, DispatchHandler, MaintenanceTask, PeerBean,
    PeerCreator, Transport,
};
use dht_telemetry::log_peer_event;
use dht_types::{CompositeKey, PeerAddress, PeerSocketAddress};
use dht_wire::{decode_address, encode_address, Command, Message, MessageType, WireReader, WireWriter};

use crate::error::RpcError;
use crate::registration::register_commands;
use crate::tracker::PeerTracker;

const NAME: &str = "handshake";

pub struct HandshakeRpc {
    peer_bean: Arc<PeerBean>,
    connection_bean: Arc<ConnectionBean>,
}

impl HandshakeRpc {
    pub fn new(peer: &PeerCreator) -> Arc<Self> {
        Arc::new(Self {
            peer_bean: Arc::clone(peer.peer_bean()),
            connection_bean: Arc::clone(peer.connection_bean()),
        })
    }

    /// Answer pings addressed to this peer.
    pub fn register(self: &Arc<Self>) -> Result<(), RpcError> {
        let key = CompositeKey::own(self.peer_bean.peer_id());
        let handler: Arc<dyn DispatchHandler> = self.clone();
        register_commands(self.connection_bean.dispatcher(), key, handler, &[Command::Ping])?;
        Ok(())
    }

    fn request(&self, target: &PeerAddress, kind: MessageType) -> Message {
        Message::request(
            self.connection_bean.p2p_id(),
            Command::Ping,
            kind,
            self.peer_bean.server_address(),
            target.clone(),
        )
    }

    async fn exchange(
        &self,
        target: &PeerAddress,
        kind: MessageType,
        transport: Transport,
    ) -> Result<Message, RpcError> {
        let request = self.request(target, kind);
        let response = self.connection_bean.sender().send(target, request, transport).await?;
        if response.kind != MessageType::Ok {
            return Err(RpcError::UnexpectedResponse {
                expected: MessageType::Ok,
                actual: response.kind,
            });
        }
        Ok(response)
    }

    // =========================================================================
    // CLIENT
    // =========================================================================

    /// Ping `target`. Returns the address the responder reports for itself.
    pub async fn ping(&self, target: &PeerAddress, transport: Transport) -> Result<PeerAddress, RpcError> {
        let response = self.exchange(target, MessageType::Request1, transport).await?;
        Ok(response.sender)
    }

    /// Fire-and-forget ping; succeeds once written.
    pub async fn ping_fire_and_forget(&self, target: &PeerAddress) -> Result<(), RpcError> {
        let request = self.request(target, MessageType::RequestFf1);
        self.connection_bean
            .sender()
            .send_fire_and_forget(target, request, Transport::Udp)
            .await?;
        Ok(())
    }

    /// Ask `target` how it sees this peer and adopt the observed IP as our
    /// own. Ports are kept: they are the ones our listeners are bound to.
    pub async fn discover(&self, target: &PeerAddress) -> Result<PeerAddress, RpcError> {
        let response = self.exchange(target, MessageType::Request2, Transport::Udp).await?;
        let observed = decode_address(&mut WireReader::new(response.payload))?;

        let own = self.peer_bean.server_address();
        if observed.ip() != own.ip() {
            info!(previous = %own.ip(), observed = %observed.ip(), "Own address changed");
            let socket = PeerSocketAddress::new(observed.ip(), own.socket().tcp_port, own.socket().udp_port);
            self.peer_bean.set_server_address(own.change_socket_address(socket));
        }
        if observed.socket().udp_port != own.socket().udp_port {
            debug!(
                bound = own.socket().udp_port,
                observed = observed.socket().udp_port,
                "Requests leave through a different port"
            );
        }
        Ok(observed)
    }

    /// Ping a peer known only by socket address and learn its identity.
    pub async fn bootstrap(&self, target: SocketAddr) -> Result<PeerAddress, RpcError> {
        let unknown = PeerAddress::unknown(target);
        let responder = self.ping(&unknown, Transport::Udp).await?;
        log_peer_event!(info, "handshake", "Bootstrapped", responder.peer_id(), %target);
        Ok(responder)
    }

    /// Periodically ping every peer the tracker knows as reachable.
    pub fn start_liveness_checks(
        self: &Arc<Self>,
        tracker: Arc<PeerTracker>,
        interval: Duration,
    ) -> Result<(), ConnectionError> {
        let rpc = Arc::clone(self);
        let task = MaintenanceTask::start(self.connection_bean.timer(), "liveness", interval, move || {
            let rpc = Arc::clone(&rpc);
            let tracker = Arc::clone(&tracker);
            async move {
                for peer in tracker.reachable_peers() {
                    // failures reach the tracker through the status listeners
                    if let Err(error) = rpc.ping(&peer, Transport::Udp).await {
                        log_peer_event!(debug, "handshake", "Liveness ping failed", peer.peer_id(), %error);
                    }
                }
            }
        })?;
        self.peer_bean.set_maintenance_task(task);
        Ok(())
    }
}

#[async_trait]
impl DispatchHandler for HandshakeRpc {
    fn name(&self) -> &str {
        NAME
    }

    async fn handle_request(&self, request: &Message) -> Result<Message, DispatchError> {
        let mut response = Message::response_to(request, MessageType::Ok);
        response.sender = self.peer_bean.server_address();

        match request.kind {
            MessageType::Request1 | MessageType::RequestFf1 => Ok(response),
            MessageType::Request2 => {
                let Some(observed) = request.observed_remote else {
                    warn!(id = request.message_id, "Discover request without observed address");
                    return Err(DispatchError::handler(NAME, "requester address not observed"));
                };
                let seen = PeerAddress::new(
                    request.sender.peer_id(),
                    PeerSocketAddress::with_port(observed.ip(), observed.port()),
                );
                let mut writer = WireWriter::new();
                encode_address(&mut writer, &seen);
                Ok(response.with_payload(writer.freeze()))
            }
            other => Err(DispatchError::handler(NAME, format!("unsupported request kind {other:?}"))),
        }
    }
}
