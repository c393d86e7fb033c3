//! Routing of inbound stanzas.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use parley_roster::{Peer, PeerError};
use parley_shared::constants::ns;
use parley_shared::stanza::MucUser;
use parley_shared::{ClientIq, ClientMessage, ClientPresence, Element, IqType, Jid, RosterEntry, Stanza, StanzaError};

use crate::events::{Event, PeerEventKind};
use crate::rooms::Occupant;
use crate::session::Session;

/// Features advertised in `disco#info` replies.
const DISCO_FEATURES: &[&str] = &[
    ns::DISCO_INFO,
    ns::BOB,
    ns::PING,
    ns::CAPS,
    ns::VERSION,
    ns::VCARD,
    ns::DATA_FORMS,
    ns::SI,
    ns::SI_FILE_TRANSFER,
    ns::SI_DIRECTORY_TRANSFER,
    ns::BYTESTREAMS,
];

fn line_breaks() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").ok()).as_ref()
}

/// Turn `<br>` markup into newlines.
fn collapse_line_breaks(body: &str) -> String {
    match line_breaks() {
        Some(re) => re.replace_all(body, "\n").into_owned(),
        None => body.to_string(),
    }
}

impl Session {
    /// Handle one inbound stanza. Returns `false` when the stream must be
    /// abandoned.
    pub async fn handle_stanza(self: &Arc<Self>, stanza: Stanza) -> bool {
        match stanza {
            Stanza::StreamError(e) => {
                self.alert(format!(
                    "Exiting in response to fatal error from server: {}",
                    e.description()
                ));
                return false;
            }
            Stanza::Message(msg) => self.receive_message(msg).await,
            Stanza::Presence(presence) => self.receive_presence(presence),
            Stanza::Iq(iq) => self.receive_iq(iq).await,
            Stanza::Unknown(el) => {
                self.info(format!("Unrecognized stanza: {}", el.to_xml()));
            }
        }
        true
    }

    // -- Messages ----------------------------------------------------------

    async fn receive_message(&self, msg: ClientMessage) {
        let from = match Jid::parse(&msg.from) {
            Ok(jid) => jid,
            Err(e) => {
                self.warn(format!("Ignoring message with bad sender {:?}: {}", msg.from, e));
                return;
            }
        };

        if msg.kind == "error" {
            let error = msg.error.unwrap_or_default();
            self.roster
                .latest_error(&from, &error.code, &error.kind, &error.condition);
            self.warn(format!(
                "Error reported from {}: {} {}",
                from, error.kind, error.condition
            ));
            return;
        }

        if msg.body.is_empty() {
            return;
        }
        self.roster.lock_resource(&from);

        let (conv, _) = self.conversations.ensure_conversation_with(&from.bare());
        let body = if conv.is_encrypted() {
            collapse_line_breaks(&msg.body)
        } else {
            msg.body
        };

        let plain = match conv.receive(body.as_bytes()) {
            Ok(plain) => plain,
            Err(e) => {
                self.alert(format!("While processing message from {}: {}", from, e));
                return;
            }
        };
        if plain.is_empty() {
            return;
        }

        self.publish(Event::Message {
            from,
            body: String::from_utf8_lossy(&plain).into_owned(),
            encrypted: conv.is_encrypted(),
            timestamp: msg.delay.unwrap_or_else(Utc::now),
        });
    }

    // -- Presence ----------------------------------------------------------

    fn receive_presence(&self, presence: ClientPresence) {
        let from = match Jid::parse(&presence.from) {
            Ok(jid) => jid,
            Err(e) => {
                self.warn(format!("Ignoring presence with bad sender {:?}: {}", presence.from, e));
                return;
            }
        };

        if let Some(muc) = &presence.muc_user {
            self.receive_occupant_presence(&from, &presence, muc);
            return;
        }

        match presence.kind.as_str() {
            "" => {
                let show = if presence.show.is_empty() {
                    "available"
                } else {
                    presence.show.as_str()
                };
                if self
                    .roster
                    .peer_became_available(&from, show, &presence.status, presence.priority)
                {
                    self.publish(Event::Presence {
                        from,
                        gone: false,
                        show: show.to_string(),
                        status: presence.status,
                    });
                }
            }
            "unavailable" => {
                if self.roster.peer_became_unavailable(&from) {
                    self.publish(Event::Presence {
                        from,
                        gone: true,
                        show: String::new(),
                        status: presence.status,
                    });
                }
            }
            "subscribe" => {
                self.roster
                    .subscribe_request(&from, &presence.id, &self.jid.to_string());
                self.publish(Event::Peer {
                    kind: PeerEventKind::SubscriptionRequest,
                    from: from.bare(),
                });
            }
            "subscribed" => self.publish(Event::Peer {
                kind: PeerEventKind::Subscribed,
                from: from.bare(),
            }),
            "unsubscribe" => self.publish(Event::Peer {
                kind: PeerEventKind::Unsubscribe,
                from: from.bare(),
            }),
            "unsubscribed" => self.publish(Event::Peer {
                kind: PeerEventKind::Unsubscribed,
                from: from.bare(),
            }),
            "error" => {
                let error = presence.error.unwrap_or_default();
                self.roster
                    .latest_error(&from, &error.code, &error.kind, &error.condition);
                self.publish(Event::PeerError {
                    from,
                    error: PeerError {
                        code: error.code,
                        kind: error.kind,
                        message: error.condition,
                    },
                });
            }
            other => self.info(format!("Unrecognized presence type {:?} from {}", other, from)),
        }
    }

    fn receive_occupant_presence(&self, from: &Jid, presence: &ClientPresence, muc: &MucUser) {
        let Some(nickname) = from.resource() else {
            self.info(format!("Room presence without a nickname from {}", from));
            return;
        };
        let room = from.bare();

        match presence.kind.as_str() {
            "" => {
                let item = muc.item.clone().unwrap_or_default();
                let occupant = Occupant {
                    nickname: nickname.to_string(),
                    real_jid: (!item.jid.is_empty()).then_some(item.jid),
                    affiliation: item.affiliation,
                    role: item.role,
                };
                if self.rooms.upsert(&room, occupant.clone()) {
                    self.publish(Event::MucOccupantJoined { room, occupant });
                } else {
                    self.publish(Event::MucOccupantUpdated { room, occupant });
                }
            }
            "unavailable" => {
                if self.rooms.remove(&room, nickname).is_some() {
                    self.publish(Event::MucOccupantLeft {
                        room,
                        nickname: nickname.to_string(),
                    });
                }
            }
            other => self.info(format!("Unrecognized room presence type {:?} from {}", other, from)),
        }
    }

    // -- IQ ----------------------------------------------------------------

    async fn receive_iq(self: &Arc<Self>, iq: ClientIq) {
        match &iq.kind {
            IqType::Get | IqType::Set => {}
            IqType::Result | IqType::Error => {
                debug!(id = %iq.id, from = %iq.from, "Dropping reply to unknown request");
                return;
            }
            IqType::Other(_) => {
                self.info(format!("unrecognized iq: {}", iq.raw.to_xml()));
                return;
            }
        }

        let (name, namespace) = match &iq.payload {
            Some(payload) => (payload.name.clone(), payload.namespace.clone()),
            None => (String::new(), String::new()),
        };
        let is_set = iq.kind == IqType::Set;

        match (namespace.as_str(), name.as_str()) {
            (ns::ROSTER, "query") if is_set => self.receive_roster_push(&iq).await,
            (ns::DISCO_INFO, _) => {
                let reply = self.disco_info();
                self.reply_result(&iq, Some(reply)).await;
            }
            (ns::VERSION, _) => {
                let reply = self.version_info();
                self.reply_result(&iq, Some(reply)).await;
            }
            (ns::PING, "ping") => self.reply_result(&iq, None).await,
            (ns::SI, "si") if is_set => self.receive_stream_initiation(iq).await,
            (ns::IBB, _) if is_set => self.receive_ibb(iq).await,
            (ns::BYTESTREAMS, "query") if is_set => self.receive_bytestream_offer(iq).await,
            _ => self.info(format!("Unknown IQ: {}", iq.raw.to_xml())),
        }
    }

    pub(crate) async fn reply_result(&self, iq: &ClientIq, payload: Option<Element>) {
        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(e) => {
                self.warn(format!("Failed to send IQ result: {}", e));
                return;
            }
        };
        if let Err(e) = conn.send_iq_result(iq, payload).await {
            self.warn(format!("Failed to send IQ result: {}", e));
        }
    }

    pub(crate) async fn reply_error(&self, iq: &ClientIq, error: StanzaError) {
        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(e) => {
                self.warn(format!("Failed to send IQ error: {}", e));
                return;
            }
        };
        if let Err(e) = conn.send_iq_error(iq, error).await {
            self.warn(format!("Failed to send IQ error: {}", e));
        }
    }

    /// A roster push is only trusted from the server itself: no sender, or
    /// the account's own bare address.
    async fn receive_roster_push(&self, iq: &ClientIq) {
        let own = self.jid.to_string();
        if !iq.from.is_empty() && iq.from != own {
            self.warn(format!("Ignoring roster IQ from bad address: {}", iq.from));
            return;
        }

        let entries = iq
            .payload
            .as_ref()
            .map(RosterEntry::list_from_query)
            .unwrap_or_default();
        if entries.is_empty() {
            self.warn("Failed to parse roster push IQ");
            return;
        }

        for entry in &entries {
            if entry.subscription == "remove" {
                match Jid::parse(&entry.jid) {
                    Ok(jid) => {
                        self.roster.remove(&jid);
                    }
                    Err(e) => self.warn(format!("Ignoring roster item {}: {}", entry.jid, e)),
                }
                continue;
            }
            match Peer::from_entry(entry, &own) {
                Ok(peer) => {
                    self.roster.add_or_replace(peer);
                }
                Err(e) => self.warn(format!("Ignoring roster item {}: {}", entry.jid, e)),
            }
        }

        self.reply_result(iq, None).await;
    }

    fn disco_info(&self) -> Element {
        let mut query = Element::new("query", ns::DISCO_INFO).with_child(
            Element::new("identity", ns::DISCO_INFO)
                .with_attr("category", "client")
                .with_attr("type", "pc")
                .with_attr("name", self.jid.to_string()),
        );
        for feature in DISCO_FEATURES {
            query = query.with_child(Element::new("feature", ns::DISCO_INFO).with_attr("var", *feature));
        }
        query
    }

    fn version_info(&self) -> Element {
        Element::new("query", ns::VERSION)
            .with_child(Element::new("name", ns::VERSION).with_text(self.config.client_name.as_str()))
            .with_child(Element::new("version", ns::VERSION).with_text(self.config.client_version.as_str()))
            .with_child(Element::new("os", ns::VERSION).with_text(self.config.client_os.as_str()))
    }

    // -- Subscriptions -----------------------------------------------------

    /// Answer a pending subscription request from `jid`. When allowed, a
    /// subscription to the peer is requested right away.
    pub async fn handle_confirm_or_deny(&self, jid: &Jid, allowed: bool) {
        let Some(id) = self.roster.get_pending_subscribe(jid) else {
            self.warn(format!("No pending subscription from {}", jid.bare()));
            return;
        };

        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(e) => {
                self.warn(format!("Error sending presence stanza: {}", e));
                return;
            }
        };

        let to = jid.bare().to_string();
        let kind = if allowed { "subscribed" } else { "unsubscribed" };
        if let Err(e) = conn.send_presence(&to, kind, &id, "").await {
            self.warn(format!("Error sending presence stanza: {}", e));
            return;
        }
        self.roster.remove_pending_subscribe(jid);

        if allowed {
            let id = rand::random::<u32>().to_string();
            if let Err(e) = conn.send_presence(&to, "subscribe", &id, "").await {
                self.warn(format!("Error sending presence stanza: {}", e));
            }
        }
    }

    /// Ask `jid` for a presence subscription.
    pub async fn request_presence_subscription(&self, jid: &Jid) -> crate::error::Result<()> {
        let id = rand::random::<u32>().to_string();
        self.conn()?
            .send_presence(&jid.bare().to_string(), "subscribe", &id, "")
            .await?;
        Ok(())
    }
}
