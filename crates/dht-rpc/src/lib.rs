//! # DHT RPC
//!
//! RPC modules that plug into the dispatch core.
//!
//! - [`HandshakeRpc`]: ping, discover, bootstrap and liveness checks.
//! - [`PeerTracker`]: reachability records fed by peer status events.
//! - [`register_commands`]: registers a handler for a distinct command set.
//!
//! ```rust,ignore
//! let peer = PeerCreator::master(config, None).await?;
//! let tracker = Arc::new(PeerTracker::new());
//! peer.peer_bean().status_listeners().add(tracker.clone());
//!
//! let handshake = HandshakeRpc::new(&peer);
//! handshake.register()?;
//! let seed = handshake.bootstrap("10.0.0.1:7700".parse()?).await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod handshake;
pub mod registration;
pub mod tracker;

pub use error::RpcError;
pub use handshake::HandshakeRpc;
pub use registration::register_commands;
pub use tracker::{PeerRecord, PeerTracker, Reachability};
