//! Protocol vocabulary shared by every Parley crate: addresses, the XML
//! element tree, typed stanza views and file-transfer payloads.

pub mod constants;
pub mod error;
pub mod filetransfer;
pub mod jid;
pub mod stanza;
pub mod xml;

pub use error::{JidError, SharedError, XmlError};
pub use jid::Jid;
pub use stanza::{ClientIq, ClientMessage, ClientPresence, IqType, RosterEntry, Stanza, StanzaError, StreamError};
pub use xml::Element;
