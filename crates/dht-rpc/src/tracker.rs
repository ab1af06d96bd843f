//! # Peer Tracker
//!
//! Reachability records built from peer status events. A peer that answered
//! is `Reachable`; one that failed `max_failures` times in a row is
//! `Unreachable` until it answers again.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use dht_connection::PeerStatusListener;
use dht_telemetry::log_peer_event;
use dht_types::{PeerAddress, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: PeerAddress,
    pub reachability: Reachability,
    /// Last time the peer answered; `None` if it never has.
    pub last_seen: Option<Instant>,
    /// Consecutive failures since the last answer.
    pub failures: u32,
}

pub struct PeerTracker {
    records: RwLock<HashMap<PeerId, PeerRecord>>,
    max_failures: u32,
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::with_max_failures(1)
    }

    pub fn with_max_failures(max_failures: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_failures: max_failures.max(1),
        }
    }

    pub fn reachability(&self, peer_id: &PeerId) -> Option<Reachability> {
        self.records.read().get(peer_id).map(|r| r.reachability)
    }

    pub fn is_reachable(&self, peer_id: &PeerId) -> bool {
        self.reachability(peer_id) == Some(Reachability::Reachable)
    }

    pub fn record(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.records.read().get(peer_id).cloned()
    }

    /// Addresses of every reachable peer, ordered by peer id.
    pub fn reachable_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .records
            .read()
            .values()
            .filter(|r| r.reachability == Reachability::Reachable)
            .map(|r| r.address.clone())
            .collect();
        peers.sort_by_key(PeerAddress::peer_id);
        peers
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerStatusListener for PeerTracker {
    fn peer_found(&self, address: &PeerAddress, reporter: Option<&PeerAddress>) {
        let mut records = self.records.write();
        let previous = records.insert(
            address.peer_id(),
            PeerRecord {
                address: address.clone(),
                reachability: Reachability::Reachable,
                last_seen: Some(Instant::now()),
                failures: 0,
            },
        );
        match previous.map(|r| r.reachability) {
            Some(Reachability::Reachable) => {}
            _ => log_peer_event!(
                info,
                "tracker",
                "Peer reachable",
                address.peer_id(),
                %address,
                reporter = ?reporter.map(PeerAddress::peer_id)
            ),
        }
    }

    fn peer_failed(&self, address: &PeerAddress, reason: &str) {
        let mut records = self.records.write();
        let record = records.entry(address.peer_id()).or_insert_with(|| PeerRecord {
            address: address.clone(),
            reachability: Reachability::Unreachable,
            last_seen: None,
            failures: 0,
        });
        record.failures = record.failures.saturating_add(1);
        if record.failures >= self.max_failures && record.reachability == Reachability::Reachable {
            log_peer_event!(info, "tracker", "Peer unreachable", address.peer_id(), failures = record.failures, reason);
            record.reachability = Reachability::Unreachable;
        } else {
            log_peer_event!(debug, "tracker", "Peer failed", address.peer_id(), failures = record.failures, reason);
        }
    }
}
