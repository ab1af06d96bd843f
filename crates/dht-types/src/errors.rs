//! # Error Types
//!
//! Errors raised while constructing value types from untrusted input.

use thiserror::Error;

/// Errors that can occur when building identifiers or addresses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypesError {
    /// Raw identifier bytes had the wrong width.
    #[error("invalid identifier length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Identifier string was not valid hexadecimal.
    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),

    /// A peer address can advertise a bounded number of relays.
    #[error("too many relays: {count} exceeds maximum of {max}")]
    TooManyRelays { count: usize, max: usize },
}
