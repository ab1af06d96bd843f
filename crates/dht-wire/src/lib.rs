//! # DHT Wire
//!
//! Everything that crosses the network as bytes.
//!
//! - [`primitives`]: big-endian two's-complement integers, byte-exact with
//!   peers running other implementations.
//! - [`message`]: the `Message` model, message types and the command table.
//! - [`codec`]: message and peer-address encoding plus TCP framing.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod codec;
pub mod error;
pub mod message;
pub mod primitives;

pub use codec::{
    decode_address, decode_message, encode_address, encode_message, frame_header, frame_length,
    FRAME_HEADER_BYTES, MAX_DATAGRAM_BYTES, MAX_MESSAGE_BYTES,
};
pub use error::WireError;
pub use message::{Command, Message, MessageType};
pub use primitives::{WireReader, WireWriter};
