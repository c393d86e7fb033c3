use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::ns;
use crate::jid::Jid;
use crate::xml::Element;

/// One top-level element read from the stream, classified by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(ClientMessage),
    Presence(ClientPresence),
    Iq(ClientIq),
    /// `<stream:error>`: fatal for the connection.
    StreamError(StreamError),
    /// Any other top-level element.
    Unknown(Element),
}

impl Stanza {
    pub fn from_element(el: Element) -> Stanza {
        if el.namespace == ns::CLIENT {
            match el.name.as_str() {
                "message" => return Stanza::Message(ClientMessage::from_element(el)),
                "presence" => return Stanza::Presence(ClientPresence::from_element(el)),
                "iq" => return Stanza::Iq(ClientIq::from_element(el)),
                _ => {}
            }
        }
        if el.is("error", ns::STREAMS) {
            return Stanza::StreamError(StreamError::from_element(&el));
        }
        Stanza::Unknown(el)
    }
}

/// The `type` attribute of an IQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
    Other(String),
}

impl IqType {
    pub fn parse(s: &str) -> IqType {
        match s {
            "get" => IqType::Get,
            "set" => IqType::Set,
            "result" => IqType::Result,
            "error" => IqType::Error,
            other => IqType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
            IqType::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientIq {
    pub from: String,
    pub to: String,
    pub id: String,
    pub kind: IqType,
    /// First child that is not an `<error>`.
    pub payload: Option<Element>,
    pub error: Option<StanzaError>,
    pub raw: Element,
}

impl ClientIq {
    pub fn from_element(el: Element) -> Self {
        let payload = el
            .children
            .iter()
            .find(|c| !c.is("error", ns::CLIENT))
            .cloned();
        let error = el.child("error", ns::CLIENT).map(StanzaError::from_element);
        Self {
            from: el.attr_or_empty("from").to_string(),
            to: el.attr_or_empty("to").to_string(),
            id: el.attr_or_empty("id").to_string(),
            kind: IqType::parse(el.attr_or_empty("type")),
            payload,
            error,
            raw: el,
        }
    }

    /// Namespace of the payload, or the empty string for an empty IQ.
    pub fn payload_ns(&self) -> &str {
        self.payload.as_ref().map(|p| p.namespace.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub from: String,
    pub to: String,
    pub id: String,
    pub kind: String,
    pub body: String,
    pub error: Option<StanzaError>,
    /// `urn:xmpp:delay` stamp, when the message was stored offline.
    pub delay: Option<DateTime<Utc>>,
    pub raw: Element,
}

impl ClientMessage {
    pub fn from_element(el: Element) -> Self {
        let delay = el
            .child("delay", ns::DELAY)
            .and_then(|d| d.attr("stamp"))
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        Self {
            from: el.attr_or_empty("from").to_string(),
            to: el.attr_or_empty("to").to_string(),
            id: el.attr_or_empty("id").to_string(),
            kind: el.attr_or_empty("type").to_string(),
            body: el.child_text("body", ns::CLIENT).unwrap_or("").to_string(),
            error: el.child("error", ns::CLIENT).map(StanzaError::from_element),
            delay,
            raw: el,
        }
    }
}

/// One `<item>` of a `muc#user` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MucItem {
    pub affiliation: String,
    pub role: String,
    pub jid: String,
    pub nick: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MucUser {
    pub item: Option<MucItem>,
    pub status_codes: Vec<String>,
}

impl MucUser {
    fn from_element(el: &Element) -> Self {
        let item = el.child("item", ns::MUC_USER).map(|i| MucItem {
            affiliation: i.attr_or_empty("affiliation").to_string(),
            role: i.attr_or_empty("role").to_string(),
            jid: i.attr_or_empty("jid").to_string(),
            nick: i.attr_or_empty("nick").to_string(),
        });
        let status_codes = el
            .children_named("status", ns::MUC_USER)
            .map(|s| s.attr_or_empty("code").to_string())
            .collect();
        Self { item, status_codes }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientPresence {
    pub from: String,
    pub to: String,
    pub id: String,
    pub kind: String,
    pub show: String,
    pub status: String,
    pub priority: i8,
    pub error: Option<StanzaError>,
    pub muc_user: Option<MucUser>,
}

impl ClientPresence {
    pub fn from_element(el: Element) -> Self {
        Self {
            from: el.attr_or_empty("from").to_string(),
            to: el.attr_or_empty("to").to_string(),
            id: el.attr_or_empty("id").to_string(),
            kind: el.attr_or_empty("type").to_string(),
            show: el.child_text("show", ns::CLIENT).unwrap_or("").trim().to_string(),
            status: el.child_text("status", ns::CLIENT).unwrap_or("").to_string(),
            priority: el
                .child_text("priority", ns::CLIENT)
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(0),
            error: el.child("error", ns::CLIENT).map(StanzaError::from_element),
            muc_user: el.child("x", ns::MUC_USER).map(MucUser::from_element),
        }
    }
}

/// A stanza-level `<error>` (RFC 6120 section 8.3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    /// `cancel`, `modify`, `auth`, `wait` or `continue`.
    pub kind: String,
    /// Defined condition element name, e.g. `bad-request`.
    pub condition: String,
    pub text: String,
    pub code: String,
}

impl StanzaError {
    pub fn new(kind: &str, condition: &str) -> Self {
        Self {
            kind: kind.to_string(),
            condition: condition.to_string(),
            ..Default::default()
        }
    }

    pub fn bad_request() -> Self {
        Self {
            code: "400".into(),
            ..Self::new("modify", "bad-request")
        }
    }

    pub fn forbidden() -> Self {
        Self {
            code: "403".into(),
            ..Self::new("cancel", "forbidden")
        }
    }

    pub fn service_unavailable() -> Self {
        Self {
            code: "503".into(),
            ..Self::new("cancel", "service-unavailable")
        }
    }

    pub fn item_not_found() -> Self {
        Self {
            code: "404".into(),
            ..Self::new("cancel", "item-not-found")
        }
    }

    pub fn resource_constraint() -> Self {
        Self {
            code: "500".into(),
            ..Self::new("modify", "resource-constraint")
        }
    }

    pub fn unexpected_request() -> Self {
        Self {
            code: "400".into(),
            ..Self::new("cancel", "unexpected-request")
        }
    }

    pub fn from_element(el: &Element) -> Self {
        let condition = el
            .children
            .iter()
            .find(|c| c.namespace == ns::STANZAS && c.name != "text")
            .map(|c| c.name.clone())
            .unwrap_or_default();
        Self {
            kind: el.attr_or_empty("type").to_string(),
            condition,
            text: el.child_text("text", ns::STANZAS).unwrap_or("").to_string(),
            code: el.attr_or_empty("code").to_string(),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("error", ns::CLIENT)
            .with_opt_attr("code", &self.code)
            .with_attr("type", self.kind.as_str())
            .with_child(Element::new(self.condition.as_str(), ns::STANZAS));
        if !self.text.is_empty() {
            el = el.with_child(Element::new("text", ns::STANZAS).with_text(self.text.as_str()));
        }
        el
    }
}

/// A `<stream:error>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamError {
    pub condition: String,
    pub text: String,
}

impl StreamError {
    pub fn from_element(el: &Element) -> Self {
        let condition = el
            .children
            .iter()
            .find(|c| c.namespace == ns::STREAM_ERRORS && c.name != "text")
            .map(|c| c.name.clone())
            .unwrap_or_default();
        Self {
            condition,
            text: el
                .child_text("text", ns::STREAM_ERRORS)
                .unwrap_or("")
                .to_string(),
        }
    }

    /// The human-readable text, or `{namespace condition}` when the server
    /// sent none.
    pub fn description(&self) -> String {
        if self.text.is_empty() {
            format!("{{{} {}}}", ns::STREAM_ERRORS, self.condition)
        } else {
            self.text.clone()
        }
    }
}

/// One `<item>` of a `jabber:iq:roster` query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub jid: String,
    pub name: String,
    pub subscription: String,
    pub ask: String,
    pub groups: Vec<String>,
}

impl RosterEntry {
    pub fn from_element(el: &Element) -> Self {
        Self {
            jid: el.attr_or_empty("jid").to_string(),
            name: el.attr_or_empty("name").to_string(),
            subscription: el.attr_or_empty("subscription").to_string(),
            ask: el.attr_or_empty("ask").to_string(),
            groups: el
                .children_named("group", ns::ROSTER)
                .map(|g| g.text.clone())
                .collect(),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("item", ns::ROSTER)
            .with_attr("jid", self.jid.as_str())
            .with_opt_attr("name", &self.name)
            .with_opt_attr("subscription", &self.subscription)
            .with_opt_attr("ask", &self.ask);
        for group in &self.groups {
            el = el.with_child(Element::new("group", ns::ROSTER).with_text(group.as_str()));
        }
        el
    }

    /// All `<item>` children of a roster `<query>`.
    pub fn list_from_query(query: &Element) -> Vec<RosterEntry> {
        query
            .children_named("item", ns::ROSTER)
            .map(RosterEntry::from_element)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Outbound builders
// ---------------------------------------------------------------------------

pub fn iq_element(to: &str, kind: &str, id: &str, payload: Option<Element>) -> Element {
    let mut el = Element::new("iq", ns::CLIENT)
        .with_opt_attr("to", to)
        .with_attr("type", kind)
        .with_attr("id", id);
    if let Some(payload) = payload {
        el = el.with_child(payload);
    }
    el
}

pub fn presence_element(to: &str, kind: &str, id: &str, status: &str) -> Element {
    let mut el = Element::new("presence", ns::CLIENT)
        .with_opt_attr("to", to)
        .with_opt_attr("type", kind)
        .with_opt_attr("id", id);
    if !status.is_empty() {
        el = el.with_child(Element::new("status", ns::CLIENT).with_text(status));
    }
    el
}

pub fn message_element(to: &Jid, body: &str) -> Element {
    Element::new("message", ns::CLIENT)
        .with_attr("to", to.to_string())
        .with_attr("type", "chat")
        .with_child(Element::new("body", ns::CLIENT).with_text(body))
}
