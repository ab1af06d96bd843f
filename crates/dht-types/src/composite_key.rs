//! Handler-registry key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer_id::PeerId;

/// Pair of (owning peer, peer acted on behalf of).
///
/// A peer serving only itself registers under `(own, own)`. A relaying peer
/// registers under `(own, relayed)` so requests addressed to the relayed peer
/// reach the relay's handler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub owner: PeerId,
    pub on_behalf_of: PeerId,
}

impl CompositeKey {
    #[must_use]
    pub const fn new(owner: PeerId, on_behalf_of: PeerId) -> Self {
        Self {
            owner,
            on_behalf_of,
        }
    }

    /// Key of a peer serving itself.
    #[must_use]
    pub const fn own(peer_id: PeerId) -> Self {
        Self::new(peer_id, peer_id)
    }

    #[must_use]
    pub fn is_delegated(&self) -> bool {
        self.owner != self.on_behalf_of
    }
}

impl fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompositeKey({:?}/{:?})", self.owner, self.on_behalf_of)
    }
}
