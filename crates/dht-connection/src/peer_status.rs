//! Peer reachability observers.

use std::sync::Arc;

use parking_lot::RwLock;

use dht_types::PeerAddress;

/// Told when a remote peer answered or failed to.
pub trait PeerStatusListener: Send + Sync {
    /// `reporter` is the local peer that saw `address`, when known.
    fn peer_found(&self, address: &PeerAddress, reporter: Option<&PeerAddress>);

    fn peer_failed(&self, address: &PeerAddress, reason: &str);
}

/// Shared list of listeners. Clones see the same list.
#[derive(Clone, Default)]
pub struct PeerStatusListeners {
    listeners: Arc<RwLock<Vec<Arc<dyn PeerStatusListener>>>>,
}

impl PeerStatusListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn PeerStatusListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove by identity. Returns whether it was present.
    pub fn remove(&self, listener: &Arc<dyn PeerStatusListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // listeners run outside the lock so they may add or remove listeners
    fn snapshot(&self) -> Vec<Arc<dyn PeerStatusListener>> {
        self.listeners.read().clone()
    }

    pub fn notify_found(&self, address: &PeerAddress, reporter: Option<&PeerAddress>) {
        if address.peer_id().is_zero() {
            return;
        }
        for listener in self.snapshot() {
            listener.peer_found(address, reporter);
        }
    }

    pub fn notify_failed(&self, address: &PeerAddress, reason: &str) {
        if address.peer_id().is_zero() {
            return;
        }
        for listener in self.snapshot() {
            listener.peer_failed(address, reason);
        }
    }
}
