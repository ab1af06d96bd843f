//! # Error Types
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | `Bind`, `AddressDiscovery`, `Identity` | peer creation | construction aborts, nothing left open |
//! | `Timeout`, `Transport`, `Rejected` | `Sender` | that request fails, nothing else |
//! | `Decode` | channels | the offending channel is closed (or datagram dropped) |
//! | `Shutdown` | `Reservation`, `Timer` | terminal, the component is gone |
//! | `ChannelClosed` | channels | operation raced a close |

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use dht_types::{CompositeKey, PeerId, TypesError};
use dht_wire::{MessageType, WireError};

use crate::config::Transport;

/// Errors surfaced by the connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to bind {transport} socket on {addr}: {source}")]
    Bind {
        transport: Transport,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no usable address found: {0}")]
    AddressDiscovery(String),

    #[error("invalid peer identity: {0}")]
    Identity(#[from] TypesError),

    #[error("request to {destination} timed out after {timeout:?}")]
    Timeout {
        destination: SocketAddr,
        timeout: Duration,
    },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error(transparent)]
    Decode(#[from] PipelineError),

    #[error("channel closed")]
    ChannelClosed,

    #[error("component shut down")]
    Shutdown,

    #[error("request rejected by {responder:?} with {kind:?}: {reason}")]
    Rejected {
        responder: PeerId,
        kind: MessageType,
        reason: String,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl ConnectionError {
    /// Label used for the failed-request metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            ConnectionError::Timeout { .. } => "timeout",
            ConnectionError::Shutdown => "shutdown",
            ConnectionError::Rejected { .. } => "rejected",
            ConnectionError::Decode(_) => "decode",
            ConnectionError::ChannelClosed => "closed",
            _ => "transport",
        }
    }

    /// The remote end of a connection went away under us. A request that
    /// fails this way on a pooled channel never reached a live handler.
    pub fn is_stale_channel(&self) -> bool {
        match self {
            ConnectionError::ChannelClosed => true,
            ConnectionError::Transport(error) => matches!(
                error.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Handler registry and handler errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The same command was listed twice in one registration.
    #[error("command {command} listed more than once for {key:?}")]
    DuplicateCommand { key: CompositeKey, command: u8 },

    /// A handler failed; answered with an exception response.
    #[error("handler {handler} failed: {reason}")]
    Handler { handler: String, reason: String },
}

impl DispatchError {
    pub fn handler(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        DispatchError::Handler {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

/// A pipeline stage fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage {stage} failed: {source}")]
    Codec {
        stage: &'static str,
        #[source]
        source: WireError,
    },

    /// The stage chain ended with the wrong kind of item, e.g. bytes left
    /// undecoded because no codec stage is installed.
    #[error("pipeline ended with {produced} where {expected} was expected")]
    Incomplete {
        expected: &'static str,
        produced: &'static str,
    },
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Codec { stage, .. } => stage,
            PipelineError::Incomplete { .. } => "pipeline",
        }
    }
}
