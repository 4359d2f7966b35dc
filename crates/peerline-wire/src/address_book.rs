//! Address book — known peers and the addresses they can be dialed on.
//!
//! The [`AddressBook`] is a thread-safe map keyed by [`PeerId`]. Each address
//! carries a [`Retention`] policy: operator-supplied destinations are stored
//! as [`Retention::Permanent`], anything learned opportunistically can be
//! given a TTL and is dropped once it expires.

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// How long an address stays in the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Never expires.
    Permanent,
    /// Expires this long after it was last added.
    Ttl(Duration),
}

/// A single stored address.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    pub addr: Multiaddr,
    pub retention: Retention,
    /// When the address was (last) added.
    pub added_at: DateTime<Utc>,
}

impl AddressRecord {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self.retention {
            Retention::Permanent => None,
            // A TTL too large to represent never expires.
            Retention::Ttl(ttl) => chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| self.added_at.checked_add_signed(ttl)),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |at| now < at)
    }
}

/// Thread-safe store of peer addresses.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    peers: Arc<RwLock<HashMap<PeerId, Vec<AddressRecord>>>>,
}

impl AddressBook {
    /// Create a new empty address book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses for a peer. Re-adding a known address refreshes its
    /// timestamp; a permanent entry is never downgraded to a TTL.
    pub fn add_addrs(&self, peer: PeerId, addrs: &[Multiaddr], retention: Retention) {
        let now = Utc::now();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let records = peers.entry(peer).or_default();

        for addr in addrs {
            match records.iter_mut().find(|r| &r.addr == addr) {
                Some(existing) => {
                    existing.added_at = now;
                    if existing.retention != Retention::Permanent {
                        existing.retention = retention;
                    }
                }
                None => records.push(AddressRecord {
                    addr: addr.clone(),
                    retention,
                    added_at: now,
                }),
            }
        }
    }

    /// Live addresses for a peer, in insertion order.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.records(peer).into_iter().map(|r| r.addr).collect()
    }

    /// Live address records for a peer.
    pub fn records(&self, peer: &PeerId) -> Vec<AddressRecord> {
        let now = Utc::now();
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer)
            .map(|records| records.iter().filter(|r| r.is_live(now)).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the book holds at least one live address for `peer`.
    pub fn contains(&self, peer: &PeerId) -> bool {
        !self.addrs(peer).is_empty()
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&self, peer: &PeerId) -> Option<Vec<AddressRecord>> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(peer)
    }

    /// Peers that have at least one live address.
    pub fn peers(&self) -> Vec<PeerId> {
        let now = Utc::now();
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .iter()
            .filter(|(_, records)| records.iter().any(|r| r.is_live(now)))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Drop expired addresses and peers left without any. Returns how many
    /// addresses were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for records in peers.values_mut() {
            let before = records.len();
            records.retain(|r| r.is_live(now));
            removed += before - records.len();
        }
        peers.retain(|_, records| !records.is_empty());
        removed
    }

    /// Number of peers with entries (expired or not).
    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
