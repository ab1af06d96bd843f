//! State owned by one logical peer.

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use dht_types::{KeyPair, PeerAddress, PeerId};

use crate::maintenance::MaintenanceTask;
use crate::peer_status::PeerStatusListeners;

/// Identity, own address, maintenance job and status listeners of one
/// logical peer. Never shared between peers.
pub struct PeerBean {
    key_pair: Option<KeyPair>,
    peer_id: PeerId,
    address: RwLock<PeerAddress>,
    maintenance: Mutex<Option<MaintenanceTask>>,
    listeners: PeerStatusListeners,
}

impl PeerBean {
    pub fn new(peer_id: PeerId, key_pair: Option<KeyPair>, address: PeerAddress) -> Self {
        Self {
            key_pair,
            peer_id,
            address: RwLock::new(address),
            maintenance: Mutex::new(None),
            listeners: PeerStatusListeners::new(),
        }
    }

    /// Use an existing listener list, e.g. one already handed to the
    /// transport.
    #[must_use]
    pub fn with_status_listeners(mut self, listeners: PeerStatusListeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.key_pair.as_ref()
    }

    /// Snapshot of this peer's own address.
    pub fn server_address(&self) -> PeerAddress {
        self.address.read().clone()
    }

    /// Replace the own address, keeping the peer id.
    pub fn set_server_address(&self, address: PeerAddress) {
        let address = address.change_peer_id(self.peer_id);
        debug!(peer = ?self.peer_id, %address, "Own address updated");
        *self.address.write() = address;
    }

    /// Install the maintenance job, stopping any previous one.
    pub fn set_maintenance_task(&self, task: MaintenanceTask) {
        if let Some(previous) = self.maintenance.lock().replace(task) {
            previous.shutdown();
        }
    }

    pub fn has_maintenance_task(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(MaintenanceTask::is_running)
    }

    /// Stop the maintenance job. Returns false if none was running.
    pub fn stop_maintenance(&self) -> bool {
        match self.maintenance.lock().take() {
            Some(task) => task.shutdown(),
            None => false,
        }
    }

    pub fn status_listeners(&self) -> &PeerStatusListeners {
        &self.listeners
    }
}

impl std::fmt::Debug for PeerBean {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerBean")
            .field("peer_id", &self.peer_id)
            .field("address", &*self.address.read())
            .field("signed", &self.key_pair.is_some())
            .finish()
    }
}
