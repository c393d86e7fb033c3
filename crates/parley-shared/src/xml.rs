//! Owned XML element tree built on top of the quick-xml event reader.
//!
//! The wire format is parsed by quick-xml; this module only turns its events
//! into [`Element`] values (resolving namespace prefixes on the way) and
//! writes elements back out as text.

use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::constants::ns;
use crate::error::XmlError;

/// One XML element with its resolved namespace.
///
/// Mixed content is flattened: all character data directly inside the
/// element is concatenated into `text`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub namespace: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Add the attribute only when `value` is not empty.
    pub fn with_opt_attr(self, key: impl Into<String>, value: &str) -> Self {
        if value.is_empty() {
            self
        } else {
            self.with_attr(key, value)
        }
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, or the empty string when absent.
    pub fn attr_or_empty(&self, key: &str) -> &str {
        self.attr(key).unwrap_or("")
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(name, namespace))
    }

    pub fn children_named<'a>(
        &'a self,
        name: &'a str,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.is(name, namespace))
    }

    /// Text of the named child, if that child exists.
    pub fn child_text(&self, name: &str, namespace: &str) -> Option<&str> {
        self.child(name, namespace).map(|c| c.text.as_str())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Serialize the element. `xmlns` is written on the root and wherever a
    /// child's namespace differs from its parent's.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, None);
        out
    }

    /// Serialize the element as a child of a parent in `parent_ns`, omitting
    /// the namespace declaration when it matches.
    pub fn to_xml_in(&self, parent_ns: &str) -> String {
        let mut out = String::new();
        self.write_into(&mut out, Some(parent_ns));
        out
    }

    fn write_into(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        if parent_ns != Some(self.namespace.as_str()) && !self.namespace.is_empty() {
            out.push_str(" xmlns=\"");
            out.push_str(&escape(self.namespace.as_str()));
            out.push('"');
        }
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_into(out, Some(&self.namespace));
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse the first complete element in `input`.
    pub fn parse(input: &str) -> Result<Element, XmlError> {
        Self::parse_in(input, "")
    }

    /// Parse the first complete element in `input`, with unprefixed names
    /// defaulting to `default_ns`.
    pub fn parse_in(input: &str, default_ns: &str) -> Result<Element, XmlError> {
        let mut reader = Reader::from_str(input);
        let mut builder = TreeBuilder::with_default_namespace(default_ns);
        loop {
            let event = reader
                .read_event()
                .map_err(|e| XmlError::Syntax(e.to_string()))?;
            if matches!(event, Event::Eof) {
                return Err(XmlError::Incomplete);
            }
            if let Some(Node::Stanza(el)) = builder.feed(event)? {
                return Ok(el);
            }
        }
    }
}

/// What a [`TreeBuilder`] produced after consuming an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// The `<stream:stream>` wrapper was opened. Its children are stanzas.
    StreamStart(Element),
    /// A complete top-level element.
    Stanza(Element),
    /// The `<stream:stream>` wrapper was closed.
    StreamEnd,
}

#[derive(Debug, Default, Clone)]
struct NamespaceStack {
    frames: Vec<Vec<(String, String)>>,
}

impl NamespaceStack {
    fn push(&mut self, decls: Vec<(String, String)>) {
        self.frames.push(decls);
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn resolve(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(ns::XML);
        }
        for frame in self.frames.iter().rev() {
            if let Some((_, uri)) = frame.iter().rev().find(|(p, _)| p == prefix) {
                return Some(uri);
            }
        }
        if prefix.is_empty() {
            Some("")
        } else {
            None
        }
    }
}

/// Incremental element builder fed with quick-xml events.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    scopes: NamespaceStack,
    open: Vec<Element>,
    in_stream: bool,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_namespace(namespace: &str) -> Self {
        let mut builder = Self::default();
        if !namespace.is_empty() {
            builder
                .scopes
                .push(vec![(String::new(), namespace.to_string())]);
        }
        builder
    }

    /// Number of currently open elements below the stream wrapper.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn feed(&mut self, event: Event<'_>) -> Result<Option<Node>, XmlError> {
        match event {
            Event::Start(e) => {
                let el = self.open_element(&e)?;
                if self.open.is_empty() && !self.in_stream && el.is("stream", ns::STREAMS) {
                    self.in_stream = true;
                    return Ok(Some(Node::StreamStart(el)));
                }
                self.open.push(el);
                Ok(None)
            }
            Event::Empty(e) => {
                let el = self.open_element(&e)?;
                self.scopes.pop();
                Ok(self.close(el))
            }
            Event::End(_) => match self.open.pop() {
                Some(el) => {
                    self.scopes.pop();
                    Ok(self.close(el))
                }
                None if self.in_stream => {
                    self.in_stream = false;
                    self.scopes.pop();
                    Ok(Some(Node::StreamEnd))
                }
                None => Err(XmlError::UnexpectedEnd),
            },
            Event::Text(t) => {
                if let Some(current) = self.open.last_mut() {
                    current.text.push_str(&decode_text(&t)?);
                }
                Ok(None)
            }
            Event::CData(c) => {
                if let Some(current) = self.open.last_mut() {
                    let raw = std::str::from_utf8(&c).map_err(|_| XmlError::InvalidUtf8)?;
                    current.text.push_str(raw);
                }
                Ok(None)
            }
            Event::GeneralRef(r) => {
                if let Some(current) = self.open.last_mut() {
                    let name = std::str::from_utf8(&r).map_err(|_| XmlError::InvalidUtf8)?;
                    let entity = format!("&{};", name);
                    current.text.push_str(&decode_text(entity.as_bytes())?);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn open_element(&mut self, e: &BytesStart<'_>) -> Result<Element, XmlError> {
        let qname = std::str::from_utf8(e.name().as_ref())
            .map_err(|_| XmlError::InvalidUtf8)?
            .to_string();
        let (prefix, local) = match qname.split_once(':') {
            Some((p, l)) => (p.to_string(), l.to_string()),
            None => (String::new(), qname.clone()),
        };

        let mut decls = Vec::new();
        let mut attrs = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| XmlError::Syntax(err.to_string()))?;
            let key = std::str::from_utf8(attr.key.as_ref()).map_err(|_| XmlError::InvalidUtf8)?;
            let value = decode_text(&attr.value)?;
            if key == "xmlns" {
                decls.push((String::new(), value));
            } else if let Some(p) = key.strip_prefix("xmlns:") {
                decls.push((p.to_string(), value));
            } else {
                attrs.push((key.to_string(), value));
            }
        }

        self.scopes.push(decls);
        let namespace = match self.scopes.resolve(&prefix) {
            Some(uri) => uri.to_string(),
            None => {
                self.scopes.pop();
                return Err(XmlError::UnknownPrefix(prefix));
            }
        };

        Ok(Element {
            name: local,
            namespace,
            attrs,
            children: Vec::new(),
            text: String::new(),
        })
    }

    fn close(&mut self, el: Element) -> Option<Node> {
        match self.open.last_mut() {
            Some(parent) => {
                parent.children.push(el);
                None
            }
            None => Some(Node::Stanza(el)),
        }
    }
}

fn decode_text(bytes: &[u8]) -> Result<String, XmlError> {
    let raw = std::str::from_utf8(bytes).map_err(|_| XmlError::InvalidUtf8)?;
    unescape(raw)
        .map(|s| s.into_owned())
        .map_err(|e| XmlError::Escape(e.to_string()))
}
