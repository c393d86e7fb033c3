//! Occupants of the multi-user chat rooms the account is present in.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use parley_shared::Jid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occupant {
    pub nickname: String,
    /// Real address, when the room discloses it.
    pub real_jid: Option<String>,
    pub affiliation: String,
    pub role: String,
}

#[derive(Debug, Default)]
pub struct Rooms {
    rooms: Mutex<HashMap<Jid, BTreeMap<String, Occupant>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<Jid, BTreeMap<String, Occupant>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or update an occupant. Returns `true` if it just joined.
    pub fn upsert(&self, room: &Jid, occupant: Occupant) -> bool {
        self.rooms()
            .entry(room.bare())
            .or_default()
            .insert(occupant.nickname.clone(), occupant)
            .is_none()
    }

    pub fn remove(&self, room: &Jid, nickname: &str) -> Option<Occupant> {
        let mut rooms = self.rooms();
        let occupants = rooms.get_mut(&room.bare())?;
        let removed = occupants.remove(nickname);
        if occupants.is_empty() {
            rooms.remove(&room.bare());
        }
        removed
    }

    pub fn occupants(&self, room: &Jid) -> Vec<Occupant> {
        self.rooms()
            .get(&room.bare())
            .map(|o| o.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.rooms().clear();
    }
}
