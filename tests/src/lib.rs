//! # DHT Test Suite
//!
//! Cross-crate scenarios that run real peers over loopback sockets.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── bootstrap.rs   # discovery and bootstrap between two peers
//!     ├── dispatch.rs    # handler routing and rejection over the wire
//!     └── shutdown.rs    # master/child cascade
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p dht-tests
//! cargo test -p dht-tests integration::shutdown::
//! ```

pub mod integration;
