//! # DHT Connection
//!
//! Connection lifecycle and message dispatch for a DHT peer.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌───────────────────── ConnectionBean (one per transport) ─┐
//!  inbound  ─► ChannelServer ─► Pipeline ─► Dispatcher ─► DispatchHandler        │
//!  outbound ◄─ Sender ◄─ Reservation ◄─ Channel ◄─ Pipeline                      │
//!                     └──────── Timer ───────────────────────────────────────────┘
//!
//!  PeerCreator ─ master ─┬─ PeerBean
//!                        ├─ child ─ PeerBean
//!                        └─ child ─ PeerBean
//! ```
//!
//! A master peer owns the transport. Child peers share it and differ only in
//! their identifier; the dispatcher routes by `(recipient, on-behalf-of)` so
//! every logical peer answers for itself over the same sockets.
//!
//! ## Fault isolation
//!
//! | Fault | Scope |
//! |-------|-------|
//! | bind / address discovery | peer creation aborts |
//! | timeout, transport error | the one request |
//! | decode error | the one channel (or datagram) |
//! | unknown command / recipient | answered with `UnknownId` |
//! | shutdown step | logged, shutdown continues |

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod channel;
pub mod channel_server;
pub mod config;
pub mod connection_bean;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod maintenance;
pub mod peer_bean;
pub mod peer_creator;
pub mod peer_status;
pub mod pipeline;
pub mod reservation;
pub mod sender;
pub mod timer;

pub use channel::Channel;
pub use channel_server::ChannelServer;
pub use config::{ChannelClientConfig, ChannelServerConfig, PeerConfig, Transport};
pub use connection_bean::ConnectionBean;
pub use discovery::discover_address;
pub use dispatcher::Dispatcher;
pub use error::{ConnectionError, DispatchError, PipelineError};
pub use handler::DispatchHandler;
pub use maintenance::MaintenanceTask;
pub use peer_bean::PeerBean;
pub use peer_creator::PeerCreator;
pub use peer_status::{PeerStatusListener, PeerStatusListeners};
pub use pipeline::{Pipeline, PipelineSession, Stage};
pub use reservation::{Reservation, ReservedChannel};
pub use sender::Sender;
pub use timer::{Timer, TimerHandle};
