//! Wire codec errors.

use thiserror::Error;

use dht_types::TypesError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes left than the next field needs.
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    #[error("unknown message type code {0}")]
    UnknownMessageType(u8),

    #[error("malformed peer address: {0}")]
    BadAddress(String),

    #[error("message of {size} bytes exceeds maximum of {max}")]
    Oversized { size: usize, max: usize },

    #[error("negative length field: {0}")]
    NegativeLength(i32),

    /// Bytes left over after a complete message was decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

impl From<TypesError> for WireError {
    fn from(err: TypesError) -> Self {
        WireError::BadAddress(err.to_string())
    }
}
