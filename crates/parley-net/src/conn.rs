use std::fmt;

use async_trait::async_trait;
use tokio::sync::oneshot;

use parley_shared::stanza::{iq_element, message_element, presence_element};
use parley_shared::{ClientIq, Element, Jid, Stanza, StanzaError};

use crate::error::Result;

/// Correlator of an outstanding IQ request. Its hex form is the IQ `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(pub u64);

impl Cookie {
    pub fn random() -> Self {
        Cookie(rand::random())
    }

    pub fn parse(id: &str) -> Option<Self> {
        u64::from_str_radix(id, 16).ok().map(Cookie)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// An authenticated connection to the server.
///
/// `next` is only ever called from one task (the read loop); every other
/// method may be called concurrently.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Full address bound to this connection.
    fn jid(&self) -> &Jid;

    /// Next inbound stanza. Replies to requests sent with [`Conn::send_iq`]
    /// are delivered on their reply channel instead.
    async fn next(&self) -> Result<Stanza>;

    /// Write one top-level element.
    async fn send_element(&self, el: Element) -> Result<()>;

    /// Send an IQ request and register a reply channel for it.
    async fn send_iq(
        &self,
        to: &str,
        kind: &str,
        payload: Element,
    ) -> Result<(oneshot::Receiver<Stanza>, Cookie)>;

    /// Forget an outstanding request. Returns whether it was still pending.
    fn cancel(&self, cookie: Cookie) -> bool;

    async fn close(&self) -> Result<()>;

    async fn send_iq_result(&self, request: &ClientIq, payload: Option<Element>) -> Result<()> {
        self.send_element(iq_element(&request.from, "result", &request.id, payload))
            .await
    }

    async fn send_iq_error(&self, request: &ClientIq, error: StanzaError) -> Result<()> {
        let mut el = iq_element(&request.from, "error", &request.id, request.payload.clone());
        el.children.push(error.to_element());
        self.send_element(el).await
    }

    async fn send_presence(&self, to: &str, kind: &str, id: &str, status: &str) -> Result<()> {
        self.send_element(presence_element(to, kind, id, status)).await
    }

    async fn send_message(&self, to: &Jid, body: &str) -> Result<()> {
        self.send_element(message_element(to, body)).await
    }
}
