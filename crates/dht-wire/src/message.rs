//! # Message Model
//!
//! A `Message` is one request or response exchanged between peers.
//! Requests and their responses share `message_id`, which is how the
//! sending side correlates them.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use dht_types::{PeerAddress, PeerId};

use crate::error::WireError;

/// Kind of a message. The wire code is the declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Request1 = 0,
    Request2 = 1,
    Request3 = 2,
    Request4 = 3,
    /// Fire-and-forget request.
    RequestFf1 = 4,
    RequestFf2 = 5,
    Ok = 6,
    PartiallyOk = 7,
    NotFound = 8,
    Denied = 9,
    /// No handler for the recipient or command.
    UnknownId = 10,
    /// The handler failed.
    Exception = 11,
    Cancel = 12,
    User1 = 13,
    User2 = 14,
}

impl MessageType {
    const ALL: [MessageType; 15] = [
        MessageType::Request1,
        MessageType::Request2,
        MessageType::Request3,
        MessageType::Request4,
        MessageType::RequestFf1,
        MessageType::RequestFf2,
        MessageType::Ok,
        MessageType::PartiallyOk,
        MessageType::NotFound,
        MessageType::Denied,
        MessageType::UnknownId,
        MessageType::Exception,
        MessageType::Cancel,
        MessageType::User1,
        MessageType::User2,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or(WireError::UnknownMessageType(code))
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::Request1
                | MessageType::Request2
                | MessageType::Request3
                | MessageType::Request4
                | MessageType::RequestFf1
                | MessageType::RequestFf2
        )
    }

    pub fn is_fire_and_forget(self) -> bool {
        matches!(self, MessageType::RequestFf1 | MessageType::RequestFf2)
    }

    /// True for response kinds that carry a failure.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            MessageType::UnknownId | MessageType::Exception | MessageType::Denied | MessageType::Cancel
        )
    }
}

/// RPC commands known to this node. The dispatcher itself only ever sees
/// the raw `u8` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    Ping = 0,
    Put = 1,
    Get = 2,
    Add = 3,
    Remove = 4,
    Neighbor = 5,
    Quit = 6,
    DirectData = 7,
    Digest = 8,
    Broadcast = 9,
    DigestBloomFilter = 10,
    Relay = 11,
    DigestAllBloomFilter = 12,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Command::Ping,
            1 => Command::Put,
            2 => Command::Get,
            3 => Command::Add,
            4 => Command::Remove,
            5 => Command::Neighbor,
            6 => Command::Quit,
            7 => Command::DirectData,
            8 => Command::Digest,
            9 => Command::Broadcast,
            10 => Command::DigestBloomFilter,
            11 => Command::Relay,
            12 => Command::DigestAllBloomFilter,
            _ => return None,
        })
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command.code()
    }
}

/// One protocol message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Network identifier; peers drop traffic from other networks.
    pub p2p_id: i32,
    pub message_id: i32,
    pub command: u8,
    pub kind: MessageType,
    pub sender: PeerAddress,
    pub recipient: PeerAddress,
    /// Peer the recipient acts for. Equals the recipient's id unless the
    /// request targets a relayed peer.
    pub on_behalf_of: PeerId,
    pub payload: Bytes,
    /// Remote socket the message actually arrived from. Filled in by the
    /// receiving channel, never encoded.
    pub observed_remote: Option<SocketAddr>,
}

impl Message {
    /// New request; `message_id` is assigned by the sender at send time.
    pub fn request(
        p2p_id: i32,
        command: impl Into<u8>,
        kind: MessageType,
        sender: PeerAddress,
        recipient: PeerAddress,
    ) -> Self {
        let on_behalf_of = recipient.peer_id();
        Self {
            p2p_id,
            message_id: 0,
            command: command.into(),
            kind,
            sender,
            recipient,
            on_behalf_of,
            payload: Bytes::new(),
            observed_remote: None,
        }
    }

    /// Response skeleton for `request`: same network, id and command, with
    /// sender and recipient swapped.
    pub fn response_to(request: &Message, kind: MessageType) -> Self {
        Self {
            p2p_id: request.p2p_id,
            message_id: request.message_id,
            command: request.command,
            kind,
            sender: request.recipient.clone(),
            recipient: request.sender.clone(),
            on_behalf_of: request.sender.peer_id(),
            payload: Bytes::new(),
            observed_remote: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn with_on_behalf_of(mut self, peer_id: PeerId) -> Self {
        self.on_behalf_of = peer_id;
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: i32) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn is_request(&self) -> bool {
        self.kind.is_request()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.message_id)
            .field("kind", &self.kind)
            .field("command", &self.command)
            .field("sender", &self.sender.peer_id())
            .field("recipient", &self.recipient.peer_id())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes_follow_declaration_order() {
        for (index, kind) in MessageType::ALL.iter().enumerate() {
            assert_eq!(kind.code() as usize, index);
            assert_eq!(MessageType::from_code(index as u8).unwrap(), *kind);
        }
        assert_eq!(
            MessageType::from_code(15).unwrap_err(),
            WireError::UnknownMessageType(15)
        );
    }

    #[test]
    fn test_request_kinds() {
        let requests: Vec<_> = MessageType::ALL
            .iter()
            .filter(|k| k.is_request())
            .collect();
        assert_eq!(requests.len(), 6);
        assert!(!MessageType::Ok.is_request());
        assert!(MessageType::RequestFf1.is_fire_and_forget());
    }

    #[test]
    fn test_command_codes_are_stable() {
        assert_eq!(Command::Ping.code(), 0);
        assert_eq!(Command::DigestAllBloomFilter.code(), 12);
        for code in 0..=12u8 {
            assert_eq!(Command::from_code(code).unwrap().code(), code);
        }
        assert!(Command::from_code(13).is_none());
    }

    #[test]
    fn test_response_swaps_endpoints() {
        let a = PeerAddress::unknown("127.0.0.1:4001".parse().unwrap()).change_peer_id(PeerId::random());
        let b = PeerAddress::unknown("127.0.0.1:4002".parse().unwrap()).change_peer_id(PeerId::random());
        let request = Message::request(1, Command::Ping, MessageType::Request1, a.clone(), b.clone())
            .with_message_id(42);
        assert_eq!(request.on_behalf_of, b.peer_id());

        let response = Message::response_to(&request, MessageType::Ok);
        assert_eq!(response.message_id, 42);
        assert_eq!(response.sender, b);
        assert_eq!(response.recipient, a);
        assert!(!response.is_request());
    }
}
