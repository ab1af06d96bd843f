//! RPC error types.

use thiserror::Error;

use dht_connection::{ConnectionError, DispatchError};
use dht_wire::{MessageType, WireError};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("malformed response payload: {0}")]
    Payload(#[from] WireError),

    #[error("expected {expected:?} response, got {actual:?}")]
    UnexpectedResponse {
        expected: MessageType,
        actual: MessageType,
    },

    #[error(transparent)]
    Registration(#[from] DispatchError),
}

impl RpcError {
    /// True when the remote peer never answered.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            RpcError::Connection(
                ConnectionError::Timeout { .. } | ConnectionError::Transport(_) | ConnectionError::ChannelClosed
            )
        )
    }
}
