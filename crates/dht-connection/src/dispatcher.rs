//! # Dispatcher
//!
//! Routes inbound requests to handlers by `(recipient, on-behalf-of, command)`.
//!
//! ## Registry
//!
//! The registry is an immutable snapshot behind an `Arc`. Writers take the
//! writer lock, copy the current snapshot, apply their change and publish
//! the copy with a single pointer swap. Readers clone the `Arc` and work on
//! a complete snapshot, so they never see half of a registration.
//!
//! ## Routing rules
//!
//! - Messages carrying another network id are dropped.
//! - Non-request messages are ignored; the `Sender` correlates responses.
//! - A ping addressed to the zero id (a bootstrap to an address whose peer
//!   id is unknown) is routed to the master peer.
//! - No bucket or no command in the bucket: `UnknownId` response.
//! - Handler error: `Exception` response carrying the error text.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use dht_telemetry::{metric_inc, MESSAGES_DISPATCHED, MESSAGES_REJECTED};
use dht_types::{CompositeKey, PeerId};
use dht_wire::{Command, Message, MessageType};

use crate::channel::Channel;
use crate::error::{ConnectionError, DispatchError};
use crate::handler::DispatchHandler;

type CommandMap = HashMap<u8, Arc<dyn DispatchHandler>>;
type Registry = HashMap<CompositeKey, Arc<CommandMap>>;

pub struct Dispatcher {
    p2p_id: i32,
    master_id: PeerId,
    snapshot: RwLock<Arc<Registry>>,
    writer: Mutex<()>,
}

impl Dispatcher {
    pub fn new(p2p_id: i32, master_id: PeerId) -> Self {
        Self {
            p2p_id,
            master_id,
            snapshot: RwLock::new(Arc::new(Registry::new())),
            writer: Mutex::new(()),
        }
    }

    pub fn p2p_id(&self) -> i32 {
        self.p2p_id
    }

    fn current(&self) -> Arc<Registry> {
        Arc::clone(&self.snapshot.read())
    }

    fn publish(&self, next: Registry) {
        *self.snapshot.write() = Arc::new(next);
    }

    /// Register `handler` for `commands` under `(owner, on_behalf_of)`.
    ///
    /// A command listed twice in one call is a configuration error and
    /// nothing is published. A command already registered by an earlier call
    /// is replaced.
    pub fn register_io_handler(
        &self,
        owner: PeerId,
        on_behalf_of: PeerId,
        handler: Arc<dyn DispatchHandler>,
        commands: &[u8],
    ) -> Result<(), DispatchError> {
        let key = CompositeKey::new(owner, on_behalf_of);
        for (i, command) in commands.iter().enumerate() {
            if commands[..i].contains(command) {
                return Err(DispatchError::DuplicateCommand {
                    key,
                    command: *command,
                });
            }
        }

        let _writer = self.writer.lock();
        let mut next = (*self.current()).clone();
        let mut bucket = next
            .get(&key)
            .map(|bucket| (**bucket).clone())
            .unwrap_or_default();
        for command in commands {
            if let Some(previous) = bucket.insert(*command, Arc::clone(&handler)) {
                debug!(
                    ?key,
                    command,
                    previous = previous.name(),
                    handler = handler.name(),
                    "Replacing registered handler"
                );
            }
        }
        next.insert(key, Arc::new(bucket));
        self.publish(next);

        debug!(?key, ?commands, handler = handler.name(), "Registered handler");
        Ok(())
    }

    /// Remove every command registered under `(owner, on_behalf_of)`.
    /// Returns whether anything was registered.
    pub fn remove_io_handlers(&self, owner: PeerId, on_behalf_of: PeerId) -> bool {
        let key = CompositeKey::new(owner, on_behalf_of);
        let _writer = self.writer.lock();
        let current = self.current();
        if !current.contains_key(&key) {
            return false;
        }
        let mut next = (*current).clone();
        next.remove(&key);
        self.publish(next);
        debug!(?key, "Removed handlers");
        true
    }

    /// Handler registered for one triple, if any.
    pub fn search_handler(
        &self,
        owner: PeerId,
        on_behalf_of: PeerId,
        command: u8,
    ) -> Option<Arc<dyn DispatchHandler>> {
        self.current()
            .get(&CompositeKey::new(owner, on_behalf_of))
            .and_then(|bucket| bucket.get(&command))
            .cloned()
    }

    pub fn registered_keys(&self) -> Vec<CompositeKey> {
        let mut keys: Vec<_> = self.current().keys().copied().collect();
        keys.sort();
        keys
    }

    fn route(&self, message: &Message) -> Option<Arc<dyn DispatchHandler>> {
        let registry = self.current();
        let recipient = message.recipient.peer_id();
        let key = if recipient.is_zero() && message.command == Command::Ping.code() {
            CompositeKey::own(self.master_id)
        } else {
            CompositeKey::new(recipient, message.on_behalf_of)
        };
        registry
            .get(&key)
            .and_then(|bucket| bucket.get(&message.command))
            .cloned()
    }

    /// Route an inbound message and produce the response to send back.
    ///
    /// `None` means nothing is sent.
    pub async fn message_received(&self, message: &Message) -> Option<Message> {
        if message.p2p_id != self.p2p_id {
            warn!(
                expected = self.p2p_id,
                actual = message.p2p_id,
                remote = ?message.observed_remote,
                "Dropping message from another network"
            );
            metric_inc!(MESSAGES_REJECTED, &["foreign_network"]);
            return None;
        }
        if !message.is_request() {
            debug!(id = message.message_id, kind = ?message.kind, "Ignoring non-request message");
            metric_inc!(MESSAGES_REJECTED, &["not_request"]);
            return None;
        }

        let Some(handler) = self.route(message) else {
            debug!(
                recipient = ?message.recipient.peer_id(),
                on_behalf_of = ?message.on_behalf_of,
                command = message.command,
                "No handler registered"
            );
            metric_inc!(MESSAGES_REJECTED, &["unknown_id"]);
            return Some(Message::response_to(message, MessageType::UnknownId));
        };

        match handler.handle_request(message).await {
            Ok(response) => {
                metric_inc!(MESSAGES_DISPATCHED);
                Some(response)
            }
            Err(error) => {
                warn!(handler = handler.name(), %error, "Handler failed");
                metric_inc!(MESSAGES_REJECTED, &["handler_fault"]);
                Some(
                    Message::response_to(message, MessageType::Exception)
                        .with_payload(error.to_string().into_bytes()),
                )
            }
        }
    }

    /// Record a transport fault on `channel`.
    ///
    /// Connected channels are closed. The shared UDP listener stays open;
    /// only the offending datagram is lost.
    pub fn exception_caught(&self, channel: &Channel, cause: &ConnectionError) {
        if channel.is_shared_listener() {
            warn!(channel = channel.id(), %cause, "Dropping faulty datagram");
            return;
        }
        warn!(
            channel = channel.id(),
            remote = ?channel.remote_addr(),
            %cause,
            "Closing channel after fault"
        );
        channel.close();
    }
}
