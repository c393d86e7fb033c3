//! Payloads of stream initiation (XEP-0095/0096), in-band bytestreams
//! (XEP-0047) and SOCKS5 bytestreams (XEP-0065).

use serde::{Deserialize, Serialize};

use crate::constants::ns;
use crate::error::SharedError;
use crate::xml::Element;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRange {
    pub offset: Option<u64>,
    pub length: Option<u64>,
}

/// The `<file>` element of a transfer offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub date: String,
    pub hash: String,
    pub desc: String,
    pub range: Option<FileRange>,
}

impl FileMeta {
    /// Bytes the sender will deliver: the range length when one is given,
    /// otherwise the whole file. Zero means unknown.
    pub fn expected_size(&self) -> u64 {
        self.range
            .as_ref()
            .and_then(|r| r.length)
            .unwrap_or(self.size)
    }

    fn from_element(el: &Element) -> Self {
        let range = el.children.iter().find(|c| c.name == "range").map(|r| FileRange {
            offset: r.attr("offset").and_then(|v| v.parse().ok()),
            length: r.attr("length").and_then(|v| v.parse().ok()),
        });
        Self {
            name: el.attr_or_empty("name").to_string(),
            size: el.attr("size").and_then(|s| s.parse().ok()).unwrap_or(0),
            date: el.attr_or_empty("date").to_string(),
            hash: el.attr_or_empty("hash").to_string(),
            desc: el
                .children
                .iter()
                .find(|c| c.name == "desc")
                .map(|d| d.text.clone())
                .unwrap_or_default(),
            range,
        }
    }

    fn to_element(&self) -> Element {
        let mut el = Element::new("file", ns::SI_FILE_TRANSFER)
            .with_attr("name", self.name.as_str())
            .with_attr("size", self.size.to_string())
            .with_opt_attr("date", &self.date)
            .with_opt_attr("hash", &self.hash);
        if !self.desc.is_empty() {
            el = el.with_child(Element::new("desc", ns::SI_FILE_TRANSFER).with_text(self.desc.as_str()));
        }
        if let Some(range) = &self.range {
            let mut r = Element::new("range", ns::SI_FILE_TRANSFER);
            if let Some(offset) = range.offset {
                r.set_attr("offset", offset.to_string());
            }
            if let Some(length) = range.length {
                r.set_attr("length", length.to_string());
            }
            el = el.with_child(r);
        }
        el
    }
}

/// A stream initiation request offering a file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiOffer {
    pub id: String,
    pub mime_type: String,
    pub profile: String,
    pub file: FileMeta,
    /// Stream methods offered by the initiator, in the order given.
    pub methods: Vec<String>,
}

impl SiOffer {
    /// Parse an `<si>` element. The feature negotiation form must be a
    /// `form` with exactly one `list-single` field named `stream-method`.
    pub fn from_element(si: &Element) -> Result<SiOffer, SharedError> {
        let file = si
            .children
            .iter()
            .find(|c| c.name == "file")
            .map(FileMeta::from_element)
            .unwrap_or_default();

        let form = si
            .child("feature", ns::FEATURE_NEG)
            .and_then(|f| f.child("x", ns::DATA_FORMS))
            .ok_or_else(|| {
                SharedError::Protocol("Invalid form for file transfer initiation: missing form".into())
            })?;
        let methods = stream_method_options(form)?;

        Ok(SiOffer {
            id: si.attr_or_empty("id").to_string(),
            mime_type: si.attr_or_empty("mime-type").to_string(),
            profile: si.attr_or_empty("profile").to_string(),
            file,
            methods,
        })
    }

    pub fn is_directory(&self) -> bool {
        self.profile == ns::SI_DIRECTORY_TRANSFER
    }

    pub fn to_element(&self) -> Element {
        let mut field = Element::new("field", ns::DATA_FORMS)
            .with_attr("var", "stream-method")
            .with_attr("type", "list-single");
        for method in &self.methods {
            field = field.with_child(
                Element::new("option", ns::DATA_FORMS)
                    .with_child(Element::new("value", ns::DATA_FORMS).with_text(method.as_str())),
            );
        }
        Element::new("si", ns::SI)
            .with_attr("id", self.id.as_str())
            .with_opt_attr("mime-type", &self.mime_type)
            .with_attr("profile", self.profile.as_str())
            .with_child(self.file.to_element())
            .with_child(
                Element::new("feature", ns::FEATURE_NEG).with_child(
                    Element::new("x", ns::DATA_FORMS)
                        .with_attr("type", "form")
                        .with_child(field),
                ),
            )
    }
}

fn stream_method_options(form: &Element) -> Result<Vec<String>, SharedError> {
    let fields: Vec<&Element> = form.children_named("field", ns::DATA_FORMS).collect();
    let valid = form.attr("type") == Some("form")
        && fields.len() == 1
        && fields[0].attr("var") == Some("stream-method")
        && fields[0].attr("type") == Some("list-single");
    if !valid {
        return Err(SharedError::Protocol(format!(
            "Invalid form for file transfer initiation: {}",
            form.to_xml()
        )));
    }
    Ok(fields[0]
        .children_named("option", ns::DATA_FORMS)
        .filter_map(|o| o.child_text("value", ns::DATA_FORMS))
        .map(str::to_string)
        .collect())
}

/// The `<si>` payload of the result accepting an offer with `method`.
pub fn chosen_method_element(method: &str) -> Element {
    Element::new("si", ns::SI)
        .with_child(Element::new("file", ns::SI_FILE_TRANSFER))
        .with_child(
            Element::new("feature", ns::FEATURE_NEG).with_child(
                Element::new("x", ns::DATA_FORMS)
                    .with_attr("type", "submit")
                    .with_child(
                        Element::new("field", ns::DATA_FORMS)
                            .with_attr("var", "stream-method")
                            .with_child(Element::new("value", ns::DATA_FORMS).with_text(method)),
                    ),
            ),
        )
}

/// The method chosen by the receiver in an `<si>` result, if any.
pub fn parse_chosen_method(si: &Element) -> Option<String> {
    si.child("feature", ns::FEATURE_NEG)?
        .child("x", ns::DATA_FORMS)?
        .children_named("field", ns::DATA_FORMS)
        .find(|f| f.attr("var") == Some("stream-method"))?
        .child_text("value", ns::DATA_FORMS)
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// In-band bytestreams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbbOpen {
    pub sid: String,
    pub block_size: usize,
    pub stanza: String,
}

impl IbbOpen {
    pub fn to_element(&self) -> Element {
        Element::new("open", ns::IBB)
            .with_attr("block-size", self.block_size.to_string())
            .with_attr("sid", self.sid.as_str())
            .with_attr("stanza", self.stanza.as_str())
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        if !el.is("open", ns::IBB) {
            return None;
        }
        Some(Self {
            sid: el.attr_or_empty("sid").to_string(),
            block_size: el.attr("block-size").and_then(|b| b.parse().ok()).unwrap_or(0),
            stanza: el.attr("stanza").unwrap_or("iq").to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbbData {
    pub sid: String,
    pub seq: u16,
    /// Base64 text of the chunk.
    pub data: String,
}

impl IbbData {
    pub fn to_element(&self) -> Element {
        Element::new("data", ns::IBB)
            .with_attr("seq", self.seq.to_string())
            .with_attr("sid", self.sid.as_str())
            .with_text(self.data.as_str())
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        if !el.is("data", ns::IBB) {
            return None;
        }
        Some(Self {
            sid: el.attr_or_empty("sid").to_string(),
            seq: el.attr("seq")?.parse().ok()?,
            data: el.text.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbbClose {
    pub sid: String,
}

impl IbbClose {
    pub fn to_element(&self) -> Element {
        Element::new("close", ns::IBB).with_attr("sid", self.sid.as_str())
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        el.is("close", ns::IBB).then(|| Self {
            sid: el.attr_or_empty("sid").to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// SOCKS5 bytestreams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHost {
    pub jid: String,
    pub host: String,
    pub port: u16,
}

/// A `<query xmlns='http://jabber.org/protocol/bytestreams'>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytestreamQuery {
    pub sid: String,
    pub streamhosts: Vec<StreamHost>,
    pub streamhost_used: Option<String>,
    pub activate: Option<String>,
}

impl BytestreamQuery {
    pub fn from_element(el: &Element) -> Option<Self> {
        if !el.is("query", ns::BYTESTREAMS) {
            return None;
        }
        let streamhosts = el
            .children_named("streamhost", ns::BYTESTREAMS)
            .filter_map(|h| {
                Some(StreamHost {
                    jid: h.attr_or_empty("jid").to_string(),
                    host: h.attr("host")?.to_string(),
                    port: h.attr("port").and_then(|p| p.parse().ok()).unwrap_or(1080),
                })
            })
            .collect();
        Some(Self {
            sid: el.attr_or_empty("sid").to_string(),
            streamhosts,
            streamhost_used: el
                .child("streamhost-used", ns::BYTESTREAMS)
                .map(|u| u.attr_or_empty("jid").to_string()),
            activate: el
                .child_text("activate", ns::BYTESTREAMS)
                .map(str::to_string),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("query", ns::BYTESTREAMS).with_opt_attr("sid", &self.sid);
        for host in &self.streamhosts {
            el = el.with_child(
                Element::new("streamhost", ns::BYTESTREAMS)
                    .with_attr("jid", host.jid.as_str())
                    .with_attr("host", host.host.as_str())
                    .with_attr("port", host.port.to_string()),
            );
        }
        if let Some(used) = &self.streamhost_used {
            el = el.with_child(Element::new("streamhost-used", ns::BYTESTREAMS).with_attr("jid", used.as_str()));
        }
        if let Some(target) = &self.activate {
            el = el.with_child(Element::new("activate", ns::BYTESTREAMS).with_text(target.as_str()));
        }
        el
    }
}
