//! In-memory roster store.
//!
//! All operations take one short lock around the backing map and never
//! block on I/O, so the store can be shared between the stanza read loop and
//! presentation code.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use parley_shared::Jid;

use crate::peer::Peer;

#[derive(Debug, Default)]
pub struct Roster {
    peers: Mutex<BTreeMap<Jid, Peer>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, BTreeMap<Jid, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a peer by (bare or full) address.
    pub fn get(&self, jid: &Jid) -> Option<Peer> {
        self.peers().get(&jid.bare()).cloned()
    }

    pub fn contains(&self, jid: &Jid) -> bool {
        self.peers().contains_key(&jid.bare())
    }

    /// Insert `peer`, merging it into the existing record if there is one.
    /// Returns whether a record was already present.
    pub fn add_or_replace(&self, peer: Peer) -> bool {
        let key = peer.jid.bare();
        let mut peers = self.peers();
        match peers.get(&key) {
            Some(existing) => {
                let merged = existing.merge_with(&peer);
                peers.insert(key, merged);
                true
            }
            None => {
                peers.insert(key, peer);
                false
            }
        }
    }

    pub fn remove(&self, jid: &Jid) -> Option<Peer> {
        let removed = self.peers().remove(&jid.bare());
        if removed.is_some() {
            debug!(peer = %jid, "Removed peer from roster");
        }
        removed
    }

    /// All peers, sorted by address.
    pub fn to_ordered_vec(&self) -> Vec<Peer> {
        self.peers().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }

    /// Record an inbound subscription request with the request `id`.
    /// `belongs_to` names the account it was addressed to.
    pub fn subscribe_request(&self, jid: &Jid, id: &str, belongs_to: &str) {
        let mut peers = self.peers();
        match peers.get_mut(&jid.bare()) {
            Some(peer) => peer.pending_subscribe_id = Some(id.to_string()),
            None => {
                peers.insert(jid.bare(), Peer::with_pending_subscribe(jid, id, belongs_to));
            }
        }
    }

    pub fn get_pending_subscribe(&self, jid: &Jid) -> Option<String> {
        self.peers()
            .get(&jid.bare())
            .and_then(|p| p.pending_subscribe_id.clone())
    }

    pub fn remove_pending_subscribe(&self, jid: &Jid) -> Option<String> {
        self.peers()
            .get_mut(&jid.bare())
            .and_then(|p| p.pending_subscribe_id.take())
    }

    /// Register an available presence from the full address `from`.
    ///
    /// Unknown peers are created. Returns `false` when the peer was already
    /// known and its main status is unchanged, i.e. nothing worth reporting.
    pub fn peer_became_available(&self, from: &Jid, show: &str, status: &str, priority: i8) -> bool {
        let resource = from.resource().unwrap_or("");
        let mut peers = self.peers();
        match peers.get_mut(&from.bare()) {
            Some(peer) => {
                let previous = peer.main_status().to_string();
                peer.add_resource(resource, show, status, priority);
                previous != show
            }
            None => {
                let mut peer = Peer::new(from);
                peer.add_resource(resource, show, status, priority);
                peers.insert(from.bare(), peer);
                true
            }
        }
    }

    /// Register an unavailable presence from `from`. A bare address takes
    /// every resource offline.
    ///
    /// Returns `true` only when a known peer has just gone fully offline.
    pub fn peer_became_unavailable(&self, from: &Jid) -> bool {
        let mut peers = self.peers();
        let Some(peer) = peers.get_mut(&from.bare()) else {
            return false;
        };
        let was_online = peer.is_online();
        match from.resource() {
            Some(resource) => {
                peer.remove_resource(resource);
            }
            None => peer.clear_resources(),
        }
        was_online && !peer.is_online()
    }

    /// Set the last error seen from a known peer.
    pub fn latest_error(&self, from: &Jid, code: &str, kind: &str, message: &str) {
        if let Some(peer) = self.peers().get_mut(&from.bare()) {
            peer.set_latest_error(code, kind, message);
        }
    }

    /// Route messages to `resource` until it goes offline.
    pub fn lock_resource(&self, from: &Jid) {
        if let (Some(peer), Some(resource)) = (self.peers().get_mut(&from.bare()), from.resource()) {
            peer.locked_resource = Some(resource.to_string());
        }
    }

    pub fn clear(&self) {
        self.peers().clear();
    }
}
