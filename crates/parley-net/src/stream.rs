//! `Conn` over an XML stream carried by any async byte pipe.
//!
//! The reader side turns quick-xml events into top-level elements. IQ
//! replies are matched against outstanding cookies and handed to the
//! waiting request; everything else is returned from `next`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use quick_xml::Reader;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};

use parley_shared::constants::ns;
use parley_shared::stanza::iq_element;
use parley_shared::xml::{Node, TreeBuilder};
use parley_shared::{ClientIq, Element, IqType, Jid, Stanza, XmlError};

use crate::conn::{Conn, Cookie};
use crate::error::{NetError, Result};

struct PendingIq {
    to: String,
    reply: oneshot::Sender<Stanza>,
}

struct StreamReader<R> {
    reader: Reader<BufReader<R>>,
    buf: Vec<u8>,
    builder: TreeBuilder,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    async fn next_element(&mut self) -> Result<Element> {
        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into_async(&mut self.buf)
                .await
                .map_err(|e| NetError::Xml(XmlError::Syntax(e.to_string())))?;
            if matches!(event, quick_xml::events::Event::Eof) {
                return Err(NetError::StreamClosed);
            }
            match self.builder.feed(event)? {
                Some(Node::Stanza(el)) => return Ok(el),
                Some(Node::StreamEnd) => return Err(NetError::StreamClosed),
                Some(Node::StreamStart(header)) => {
                    debug!(id = header.attr_or_empty("id"), "Server opened stream");
                }
                None => {}
            }
        }
    }
}

pub struct XmlConn<R, W> {
    jid: Jid,
    reader: AsyncMutex<StreamReader<R>>,
    writer: AsyncMutex<W>,
    inflight: Mutex<HashMap<Cookie, PendingIq>>,
    stream_opened: AtomicBool,
    closed: AtomicBool,
}

impl<R, W> XmlConn<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already authenticated byte pipe bound to `jid`.
    pub fn new(jid: Jid, reader: R, writer: W) -> Self {
        Self {
            jid,
            reader: AsyncMutex::new(StreamReader {
                reader: Reader::from_reader(BufReader::new(reader)),
                buf: Vec::new(),
                builder: TreeBuilder::new(),
            }),
            writer: AsyncMutex::new(writer),
            inflight: Mutex::new(HashMap::new()),
            stream_opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Write the `<stream:stream>` header towards the account's domain.
    pub async fn open_stream(&self) -> Result<()> {
        let header = format!(
            "<?xml version='1.0'?><stream:stream to='{}' xmlns='{}' xmlns:stream='{}' version='1.0'>",
            self.jid.domain(),
            ns::CLIENT,
            ns::STREAMS
        );
        self.write_raw(&header).await?;
        self.stream_opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write_raw(&self, data: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<Cookie, PendingIq>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `from` is a legitimate sender for a reply to a request sent
    /// to `to`.
    fn reply_matches(&self, to: &str, from: &str) -> bool {
        if from == to {
            return true;
        }
        if to.is_empty() {
            let bare = self.jid.bare().to_string();
            return from == bare || from == self.jid.domain();
        }
        false
    }

    fn take_pending(&self, iq: &ClientIq) -> Option<oneshot::Sender<Stanza>> {
        let cookie = Cookie::parse(&iq.id)?;
        let mut inflight = self.inflight();
        let matches = inflight
            .get(&cookie)
            .map(|p| self.reply_matches(&p.to, &iq.from))?;
        if !matches {
            warn!(id = %iq.id, from = %iq.from, "Reply from unexpected sender");
            return None;
        }
        inflight.remove(&cookie).map(|p| p.reply)
    }
}

#[async_trait]
impl<R, W> Conn for XmlConn<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn jid(&self) -> &Jid {
        &self.jid
    }

    async fn next(&self) -> Result<Stanza> {
        let mut reader = self.reader.lock().await;
        loop {
            let el = match reader.next_element().await {
                Ok(el) => el,
                Err(e) => {
                    // Outstanding requests can no longer be answered.
                    self.inflight().clear();
                    return Err(e);
                }
            };
            let stanza = Stanza::from_element(el);
            if let Stanza::Iq(iq) = &stanza {
                if matches!(iq.kind, IqType::Result | IqType::Error) {
                    if let Some(reply) = self.take_pending(iq) {
                        trace!(id = %iq.id, "Routing IQ reply");
                        let _ = reply.send(stanza);
                        continue;
                    }
                }
            }
            return Ok(stanza);
        }
    }

    async fn send_element(&self, el: Element) -> Result<()> {
        let xml = if self.stream_opened.load(Ordering::SeqCst) {
            el.to_xml_in(ns::CLIENT)
        } else {
            el.to_xml()
        };
        self.write_raw(&xml).await
    }

    async fn send_iq(
        &self,
        to: &str,
        kind: &str,
        payload: Element,
    ) -> Result<(oneshot::Receiver<Stanza>, Cookie)> {
        let cookie = Cookie::random();
        let (tx, rx) = oneshot::channel();
        self.inflight().insert(
            cookie,
            PendingIq {
                to: to.to_string(),
                reply: tx,
            },
        );
        let el = iq_element(to, kind, &cookie.to_string(), Some(payload));
        if let Err(e) = self.send_element(el).await {
            self.inflight().remove(&cookie);
            return Err(e);
        }
        Ok((rx, cookie))
    }

    fn cancel(&self, cookie: Cookie) -> bool {
        self.inflight().remove(&cookie).is_some()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.stream_opened.load(Ordering::SeqCst) {
            // Best effort: the peer may already be gone.
            let _ = self.write_raw("</stream:stream>").await;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.inflight().clear();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

    type TestConn = XmlConn<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (TestConn, DuplexStream) {
        let (ours, theirs) = duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        let jid = Jid::parse("some@one.org/desk").unwrap();
        (XmlConn::new(jid, r, w), theirs)
    }

    const HEADER: &str = "<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' id='s1'>";

    #[tokio::test]
    async fn test_reads_stanzas_inside_stream() {
        let (conn, mut server) = pair();
        server
            .write_all(format!("{}<presence from='a@b.org/r'/><message from='a@b.org/r'><body>yo</body></message>", HEADER).as_bytes())
            .await
            .unwrap();

        assert!(matches!(conn.next().await.unwrap(), Stanza::Presence(_)));
        match conn.next().await.unwrap() {
            Stanza::Message(m) => assert_eq!(m.body, "yo"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_error_and_close() {
        let (conn, mut server) = pair();
        server
            .write_all(
                format!(
                    "{}<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                     <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Replaced</text></stream:error></stream:stream>",
                    HEADER
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        match conn.next().await.unwrap() {
            Stanza::StreamError(e) => {
                assert_eq!(e.condition, "conflict");
                assert_eq!(e.description(), "Replaced");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(conn.next().await, Err(NetError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_iq_reply_goes_to_cookie() {
        let (conn, mut server) = pair();
        let (reply, cookie) = conn
            .send_iq("", "get", Element::new("query", ns::ROSTER))
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        let sent = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(sent.contains(&format!("id=\"{}\"", cookie)));
        assert!(sent.contains("jabber:iq:roster"));

        server
            .write_all(
                format!(
                    "{}<iq type='result' id='{}'/><presence from='x@y.org/z'/>",
                    HEADER, cookie
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        // The result is routed to the reply channel, so next() sees the presence.
        assert!(matches!(conn.next().await.unwrap(), Stanza::Presence(_)));
        assert!(matches!(reply.await.unwrap(), Stanza::Iq(_)));
        assert!(!conn.cancel(cookie));
    }

    #[tokio::test]
    async fn test_reply_from_wrong_sender_is_not_routed() {
        let (conn, mut server) = pair();
        let (_reply, cookie) = conn
            .send_iq("peer@b.org/r", "set", Element::new("close", ns::IBB))
            .await
            .unwrap();
        server
            .write_all(format!("{}<iq type='result' from='evil@b.org/r' id='{}'/>", HEADER, cookie).as_bytes())
            .await
            .unwrap();

        assert!(matches!(conn.next().await.unwrap(), Stanza::Iq(_)));
        assert!(conn.cancel(cookie));
    }

    #[tokio::test]
    async fn test_unknown_element_is_not_fatal() {
        let (conn, mut server) = pair();
        server
            .write_all(format!("{}<stream:features/><presence/>", HEADER).as_bytes())
            .await
            .unwrap();
        assert!(matches!(conn.next().await.unwrap(), Stanza::Unknown(_)));
        assert!(matches!(conn.next().await.unwrap(), Stanza::Presence(_)));
    }

    #[tokio::test]
    async fn test_eof_is_stream_closed() {
        let (conn, server) = pair();
        drop(server);
        assert!(matches!(conn.next().await, Err(NetError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _server) = pair();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.send_presence("", "", "", "").await,
            Err(NetError::NotConnected)
        ));
    }
}
