//! # DHT Types Crate
//!
//! Value types shared across the workspace.
//!
//! ## Design Principles
//!
//! - **Immutability**: every type here is a value. Changing a field means
//!   deriving a new value (`PeerAddress::change_peer_id`, ...).
//! - **Total order**: `PeerId` orders as an unsigned big-endian integer, so
//!   the derived `Ord` on the raw bytes is the numeric order.
//! - **No I/O**: nothing in this crate touches the network.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod address;
pub mod composite_key;
pub mod errors;
pub mod keys;
pub mod peer_id;

pub use address::{PeerAddress, PeerSocketAddress, MAX_RELAYS};
pub use composite_key::CompositeKey;
pub use errors::TypesError;
pub use keys::KeyPair;
pub use peer_id::{PeerId, PEER_ID_BITS, PEER_ID_BYTES};
