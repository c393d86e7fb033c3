use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use parley_shared::{Jid, JidError, RosterEntry};

/// Presence of one resource of a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub online: bool,
    /// `show` value: `available`, `away`, `chat`, `dnd`, `xa`.
    pub show: String,
    pub status: String,
    pub priority: i8,
}

/// The last stanza error received from a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerError {
    pub code: String,
    pub kind: String,
    pub message: String,
}

/// One contact, keyed by its bare address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Bare address.
    pub jid: Jid,
    /// Name from the server roster.
    pub name: String,
    /// Local name chosen by the user, shown in place of `name`.
    pub nickname: String,
    /// `none`, `to`, `from` or `both`. `remove` never reaches the store.
    pub subscription: String,
    /// A subscription request from us is waiting for an answer.
    pub asked: bool,
    pub groups: BTreeSet<String>,
    /// Last error stanza received from this peer.
    pub latest_error: Option<PeerError>,
    /// Id of the peer's subscription request we have not answered yet.
    pub pending_subscribe_id: Option<String>,
    /// Account this peer belongs to.
    pub belongs_to: String,
    /// Resource messages are routed to, once the peer has answered from it.
    pub locked_resource: Option<String>,
    /// Resource name (empty for a bare presence) to its current status.
    resources: BTreeMap<String, Status>,
}

impl Peer {
    pub fn new(jid: &Jid) -> Self {
        Self {
            jid: jid.bare(),
            name: String::new(),
            nickname: String::new(),
            subscription: String::new(),
            asked: false,
            groups: BTreeSet::new(),
            latest_error: None,
            pending_subscribe_id: None,
            belongs_to: String::new(),
            locked_resource: None,
            resources: BTreeMap::new(),
        }
    }

    /// A peer built from a roster item.
    pub fn from_entry(entry: &RosterEntry, belongs_to: &str) -> Result<Self, JidError> {
        let jid = Jid::parse(&entry.jid)?;
        Ok(Self {
            name: entry.name.clone(),
            subscription: entry.subscription.clone(),
            asked: entry.ask == "subscribe",
            groups: entry.groups.iter().cloned().collect(),
            belongs_to: belongs_to.to_string(),
            ..Self::new(&jid)
        })
    }

    /// A peer with a single resource online in `show` state.
    pub fn with_state(jid: &Jid, show: &str, status: &str, belongs_to: &str, resource: &str) -> Self {
        let mut peer = Self {
            belongs_to: belongs_to.to_string(),
            ..Self::new(jid)
        };
        peer.add_resource(resource, show, status, 0);
        peer
    }

    /// A peer that is only known because it asked to subscribe.
    pub fn with_pending_subscribe(jid: &Jid, id: &str, belongs_to: &str) -> Self {
        Self {
            pending_subscribe_id: Some(id.to_string()),
            belongs_to: belongs_to.to_string(),
            ..Self::new(jid)
        }
    }

    pub fn to_entry(&self) -> RosterEntry {
        RosterEntry {
            jid: self.jid.to_string(),
            name: self.name.clone(),
            subscription: self.subscription.clone(),
            ask: if self.asked { "subscribe".into() } else { String::new() },
            groups: self.groups.iter().cloned().collect(),
        }
    }

    /// Combine this (pre-existing) record with `newer`. Groups of this record
    /// win whenever it has any; other fields take the newer value when set.
    pub fn merge_with(&self, newer: &Peer) -> Peer {
        let pick = |old: &String, new: &String| if new.is_empty() { old.clone() } else { new.clone() };
        Peer {
            jid: self.jid.clone(),
            name: pick(&self.name, &newer.name),
            nickname: pick(&self.nickname, &newer.nickname),
            subscription: pick(&self.subscription, &newer.subscription),
            asked: newer.asked,
            groups: if self.groups.is_empty() {
                newer.groups.clone()
            } else {
                self.groups.clone()
            },
            latest_error: newer.latest_error.clone().or_else(|| self.latest_error.clone()),
            pending_subscribe_id: newer
                .pending_subscribe_id
                .clone()
                .or_else(|| self.pending_subscribe_id.clone()),
            belongs_to: pick(&self.belongs_to, &newer.belongs_to),
            locked_resource: self.locked_resource.clone(),
            resources: if self.resources.is_empty() {
                newer.resources.clone()
            } else {
                self.resources.clone()
            },
        }
    }

    pub fn add_resource(&mut self, resource: &str, show: &str, status: &str, priority: i8) {
        self.resources.insert(
            resource.to_string(),
            Status {
                online: true,
                show: show.to_string(),
                status: status.to_string(),
                priority,
            },
        );
    }

    /// Returns whether the resource was present.
    pub fn remove_resource(&mut self, resource: &str) -> bool {
        if self.locked_resource.as_deref() == Some(resource) {
            self.locked_resource = None;
        }
        self.resources.remove(resource).is_some()
    }

    pub fn clear_resources(&mut self) {
        self.resources.clear();
        self.locked_resource = None;
    }

    pub fn resources(&self) -> impl Iterator<Item = (&str, &Status)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_online(&self) -> bool {
        !self.resources.is_empty()
    }

    fn main_resource(&self) -> Option<&Status> {
        // Highest priority wins; on a tie the first resource name in order.
        self.resources
            .values()
            .fold(None, |best: Option<&Status>, s| match best {
                Some(b) if b.priority >= s.priority => Some(b),
                _ => Some(s),
            })
    }

    /// `show` of the highest-priority resource, empty when offline.
    pub fn main_status(&self) -> &str {
        self.main_resource().map(|s| s.show.as_str()).unwrap_or("")
    }

    pub fn main_status_msg(&self) -> &str {
        self.main_resource().map(|s| s.status.as_str()).unwrap_or("")
    }

    pub fn set_latest_error(&mut self, code: &str, kind: &str, message: &str) {
        self.latest_error = Some(PeerError {
            code: code.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    /// Nickname, then roster name, then the address.
    pub fn name_for_presentation(&self) -> String {
        if !self.nickname.is_empty() {
            self.nickname.clone()
        } else if !self.name.is_empty() {
            self.name.clone()
        } else {
            self.jid.to_string()
        }
    }

    /// One-line debugging representation.
    pub fn dump(&self) -> String {
        let groups: Vec<&str> = self.groups.iter().map(String::as_str).collect();
        let mut resources = String::new();
        for (i, (name, status)) in self.resources.iter().enumerate() {
            if i > 0 {
                resources.push(' ');
            }
            let _ = write!(resources, "{}:{}", name, status.show);
        }
        format!(
            "Peer{{{}[{} ({})], subscription='{}', status='{}'('{}') online={}, asked={}, \
             pendingSubscribe='{}', belongsTo='{}', resources=[{}], lockedResource='{}', groups={:?}}}",
            self.jid,
            self.name,
            self.nickname,
            self.subscription,
            self.main_status(),
            self.main_status_msg(),
            self.is_online(),
            self.asked,
            self.pending_subscribe_id.as_deref().unwrap_or(""),
            self.belongs_to,
            resources,
            self.locked_resource.as_deref().unwrap_or(""),
            groups,
        )
    }
}
