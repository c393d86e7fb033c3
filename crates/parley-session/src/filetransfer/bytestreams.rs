//! SOCKS5 bytestreams (XEP-0065). Both directions go through a proxy: the
//! sender discovers stream hosts from its configured proxies, the receiver
//! connects to the first offered host that answers.

use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use parley_net::socks5;
use parley_shared::filetransfer::{BytestreamQuery, StreamHost};
use parley_shared::{ClientIq, Element, IqType, Stanza, StanzaError};

use super::recv::RecvContext;
use super::registry::Method;
use super::send::SendContext;
use super::socks5_destination;
use super::wrap::WrappedReader;
use crate::error::TransferError;
use crate::session::Session;

impl Session {
    /// The sender offers its stream hosts for an accepted transfer.
    pub(crate) async fn receive_bytestream_offer(self: &Arc<Self>, iq: ClientIq) {
        let Some(query) = iq.payload.as_ref().and_then(BytestreamQuery::from_element) else {
            self.reply_error(&iq, StanzaError::bad_request()).await;
            return;
        };
        let ctx = self
            .recv_context(&query.sid, &iq.from)
            .filter(|ctx| ctx.method() == Some(Method::Bytestreams));
        let Some(ctx) = ctx else {
            self.reply_error(&iq, StanzaError::item_not_found()).await;
            return;
        };
        let Some(conn) = self.connection() else {
            return;
        };
        let own = conn.jid().to_string();
        tokio::spawn(self.clone().bytestream_receive(ctx, iq, query.streamhosts, own));
    }

    async fn connect_streamhost(&self, hosts: &[StreamHost], destination: &str) -> Option<(String, TcpStream)> {
        for host in hosts {
            let addr = format!("{}:{}", host.host, host.port);
            match timeout(
                self.config.bytestream_connect_timeout,
                socks5::connect(&addr, destination, 0),
            )
            .await
            {
                Ok(Ok(stream)) => return Some((host.jid.clone(), stream)),
                Ok(Err(e)) => debug!(host = %addr, error = %e, "Stream host unusable"),
                Err(_) => debug!(host = %addr, "Timed out connecting to stream host"),
            }
        }
        None
    }

    async fn bytestream_receive(
        self: Arc<Self>,
        ctx: Arc<RecvContext>,
        iq: ClientIq,
        hosts: Vec<StreamHost>,
        own: String,
    ) {
        let destination = socks5_destination(&ctx.sid, &ctx.peer.to_string(), &own);
        let Some((used, mut stream)) = self.connect_streamhost(&hosts, &destination).await else {
            self.reply_error(&iq, StanzaError::item_not_found()).await;
            self.fail_receive(
                &ctx,
                TransferError::Protocol("Couldn't connect to any of the offered stream hosts".into()),
            )
            .await;
            return;
        };

        debug!(sid = %ctx.sid, streamhost = %used, "Bytestream connected");
        let used = BytestreamQuery {
            sid: ctx.sid.clone(),
            streamhost_used: Some(used),
            ..Default::default()
        };
        self.reply_result(&iq, Some(used.to_element())).await;

        let mut buf = vec![0u8; self.config.bytestream_chunk_size];
        loop {
            let read = tokio::select! {
                _ = ctx.done.cancelled() => return,
                read = stream.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => {
                    self.finish_receive(&ctx).await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    self.fail_receive(&ctx, TransferError::Io(e)).await;
                    return;
                }
            };

            let written = {
                let mut guard = ctx.state.lock().await;
                let Some(state) = guard.as_mut() else {
                    return;
                };
                state.write(&buf[..n]).await
            };
            match written {
                Ok(total) => ctx.control.report_progress(total),
                Err(e) => {
                    self.fail_receive(&ctx, TransferError::Io(e)).await;
                    return;
                }
            }
        }
    }

    /// Send an IQ and wait for the IQ answering it.
    async fn request(&self, to: &str, kind: &str, payload: Element) -> Result<ClientIq, TransferError> {
        let (reply, _) = self
            .send_iq(to, kind, payload)
            .await
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        match reply.await {
            Ok(Stanza::Iq(iq)) => Ok(iq),
            Ok(_) => Err(TransferError::Protocol(format!("Unexpected answer from {}", to))),
            Err(_) => Err(TransferError::Protocol(format!("No answer from {}", to))),
        }
    }

    /// Ask every configured proxy for its stream host.
    async fn discover_streamhosts(&self) -> Vec<StreamHost> {
        let mut hosts = Vec::new();
        for proxy in &self.config.file_transfer_proxies {
            let query = BytestreamQuery::default().to_element();
            match self.request(&proxy.to_string(), "get", query).await {
                Ok(iq) if iq.kind == IqType::Result => hosts.extend(
                    iq.payload
                        .as_ref()
                        .and_then(BytestreamQuery::from_element)
                        .map(|q| q.streamhosts)
                        .unwrap_or_default(),
                ),
                Ok(_) => debug!(proxy = %proxy, "Proxy refused to announce a stream host"),
                Err(e) => debug!(proxy = %proxy, error = %e, "Proxy discovery failed"),
            }
        }
        hosts
    }

    pub(crate) async fn bytestream_send(self: Arc<Self>, ctx: Arc<SendContext>) {
        if let Err(e) = self.try_bytestream_send(&ctx).await {
            self.fail_send(&ctx, e);
        }
    }

    async fn try_bytestream_send(&self, ctx: &Arc<SendContext>) -> Result<(), TransferError> {
        let own = self
            .conn()
            .map_err(|e| TransferError::Protocol(e.to_string()))?
            .jid()
            .to_string();
        let peer = ctx.peer.to_string();

        let hosts = self.discover_streamhosts().await;
        if hosts.is_empty() {
            return Err(TransferError::Protocol("No file transfer proxy is available".into()));
        }

        let offer = BytestreamQuery {
            sid: ctx.sid.clone(),
            streamhosts: hosts.clone(),
            ..Default::default()
        };
        let reply = self.request(&peer, "set", offer.to_element()).await?;
        if reply.kind != IqType::Result {
            return Err(TransferError::Declined);
        }
        let used = reply
            .payload
            .as_ref()
            .and_then(BytestreamQuery::from_element)
            .and_then(|q| q.streamhost_used)
            .ok_or_else(|| TransferError::Protocol("The peer didn't name a stream host".into()))?;
        let host = hosts
            .iter()
            .find(|h| h.jid == used)
            .ok_or_else(|| TransferError::Protocol(format!("The peer chose an unknown stream host {}", used)))?;

        let destination = socks5_destination(&ctx.sid, &own, &peer);
        let (_, mut stream) = self
            .connect_streamhost(std::slice::from_ref(host), &destination)
            .await
            .ok_or_else(|| TransferError::Protocol(format!("Couldn't connect to stream host {}", used)))?;

        let activate = BytestreamQuery {
            sid: ctx.sid.clone(),
            activate: Some(peer),
            ..Default::default()
        };
        if self.request(&host.jid, "set", activate.to_element()).await?.kind != IqType::Result {
            return Err(TransferError::Protocol("The proxy refused to activate the bytestream".into()));
        }
        info!(sid = %ctx.sid, streamhost = %host.jid, "Bytestream activated");

        let chunk_size = self.config.bytestream_chunk_size;
        let file = File::open(&ctx.path).await?;
        let mut reader = WrappedReader::new(file, ctx.take_wrapper(), chunk_size);
        loop {
            if self.check_send_cancelled(ctx, None).await {
                return Ok(());
            }
            let Some(block) = reader.next_block(chunk_size).await? else {
                break;
            };
            stream.write_all(&block).await?;
            ctx.control.report_progress(reader.consumed());
        }
        stream.shutdown().await?;
        self.finish_send(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::events::Event;
    use crate::filetransfer::{FileTransferControl, TransferUpdate};
    use crate::test_support::{drain, si_offer, stanza, test_config, test_session, test_session_with, wait_until, MockConn};
    use parley_shared::constants::ns;
    use parley_shared::filetransfer::{chosen_method_element, SiOffer};
    use parley_shared::Jid;

    const PEER: &str = "romeo@example.net/orchard";
    const PROXY: &str = "proxy.example.net";

    /// Server side of the SOCKS5 negotiation. Returns the requested
    /// destination name.
    async fn accept_socks5(stream: &mut TcpStream) -> String {
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        stream.write_all(&[5, 0]).await.unwrap();

        let mut head = [0u8; 5];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[5, 1, 0, 3]);
        let mut rest = vec![0u8; head[4] as usize + 2];
        stream.read_exact(&mut rest).await.unwrap();
        let name = String::from_utf8(rest[..rest.len() - 2].to_vec()).unwrap();

        let mut reply = vec![5, 0, 0, 3, name.len() as u8];
        reply.extend_from_slice(name.as_bytes());
        reply.extend_from_slice(&[0, 0]);
        stream.write_all(&reply).await.unwrap();
        name
    }

    /// A proxy that pushes `payload` to whoever connects.
    async fn serving_proxy(payload: &'static [u8]) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let name = accept_socks5(&mut stream).await;
            stream.write_all(payload).await.unwrap();
            stream.shutdown().await.unwrap();
            name
        });
        (port, task)
    }

    /// A proxy that collects everything written to it.
    async fn collecting_proxy() -> (u16, JoinHandle<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let name = accept_socks5(&mut stream).await;
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await.unwrap();
            (name, data)
        });
        (port, task)
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn streamhost_offer(port: u16) -> String {
        format!(
            "<iq type='set' id='bs' from='{PEER}'>\
             <query xmlns='http://jabber.org/protocol/bytestreams' sid='sid1' mode='tcp'>\
             <streamhost jid='{PROXY}' host='127.0.0.1' port='{port}'/></query></iq>"
        )
    }

    async fn accepted(session: &Arc<Session>, conn: &MockConn, destination: std::path::PathBuf) -> FileTransferControl {
        let (id, mut events) = session.subscribe();
        session
            .handle_stanza(stanza(&si_offer("sid1", &[ns::BYTESTREAMS, ns::IBB])))
            .await;
        let request = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                Event::FileTransfer(request) => Some(request),
                _ => None,
            })
            .unwrap();
        session.unsubscribe(id);
        request.answer.accept(destination);
        assert!(wait_until(|| !conn.sent().is_empty()).await);
        request.control
    }

    fn reply_to(conn: &MockConn, id: &str) -> Option<Element> {
        conn.sent().into_iter().find(|el| el.attr("id") == Some(id))
    }

    #[tokio::test]
    async fn test_receive_over_proxy() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        let dir = tempfile::TempDir::new().unwrap();
        let destination = dir.path().join("out.txt");
        let control = accepted(&session, &conn, destination.clone()).await;
        let mut updates = control.updates().unwrap();

        let (port, proxy) = serving_proxy(b"hello world").await;
        session.handle_stanza(stanza(&streamhost_offer(port))).await;

        loop {
            match updates.recv().await {
                Some(TransferUpdate::Finished) => break,
                Some(TransferUpdate::Progress { .. }) => {}
                other => panic!("unexpected update {:?}", other),
            }
        }
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");
        assert_eq!(
            proxy.await.unwrap(),
            socks5_destination("sid1", PEER, "some@one.org/foo")
        );

        let reply = reply_to(&conn, "bs").unwrap();
        assert_eq!(reply.attr("type"), Some("result"));
        let used = BytestreamQuery::from_element(reply.child("query", ns::BYTESTREAMS).unwrap()).unwrap();
        assert_eq!(used.streamhost_used.as_deref(), Some(PROXY));
        assert_eq!(session.active_transfers(), 0);
    }

    #[tokio::test]
    async fn test_stream_ending_early_discards_file() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        let dir = tempfile::TempDir::new().unwrap();
        let destination = dir.path().join("out.txt");
        let control = accepted(&session, &conn, destination.clone()).await;
        let mut updates = control.updates().unwrap();

        // The offer announces eleven bytes.
        let (port, proxy) = serving_proxy(b"hello").await;
        session.handle_stanza(stanza(&streamhost_offer(port))).await;

        let last = loop {
            match updates.recv().await {
                Some(TransferUpdate::Progress { .. }) => {}
                other => break other,
            }
        };
        assert_eq!(
            last,
            Some(TransferUpdate::Error(
                "Incorrect final size of file - this implies the transfer was cancelled".into()
            ))
        );
        proxy.await.unwrap();
        assert!(!destination.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(session.active_transfers(), 0);
    }

    #[tokio::test]
    async fn test_receive_without_reachable_streamhost() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        let dir = tempfile::TempDir::new().unwrap();
        let control = accepted(&session, &conn, dir.path().join("out.txt")).await;
        let mut updates = control.updates().unwrap();

        let port = unused_port().await;
        session.handle_stanza(stanza(&streamhost_offer(port))).await;

        assert!(matches!(updates.recv().await, Some(TransferUpdate::Error(_))));
        assert!(wait_until(|| reply_to(&conn, "bs").is_some()).await);
        let reply = reply_to(&conn, "bs").unwrap();
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(session.active_transfers(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_offer_for_ibb_transfer_is_rejected() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        let (id, mut events) = session.subscribe();
        session.handle_stanza(stanza(&si_offer("sid1", &[ns::IBB]))).await;
        let request = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                Event::FileTransfer(request) => Some(request),
                _ => None,
            })
            .unwrap();
        session.unsubscribe(id);
        let dir = tempfile::TempDir::new().unwrap();
        request.answer.accept(dir.path().join("out.txt"));
        assert!(wait_until(|| !conn.sent().is_empty()).await);

        session.handle_stanza(stanza(&streamhost_offer(1080))).await;

        let reply = reply_to(&conn, "bs").unwrap();
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(session.active_transfers(), 1);
    }

    #[tokio::test]
    async fn test_send_over_proxy() {
        let (port, proxy) = collecting_proxy().await;
        let conn = MockConn::new("some@one.org/foo");
        conn.respond_with(move |el| {
            if el.child("si", ns::SI).is_some() {
                return Some(format!(
                    "<iq type='result'>{}</iq>",
                    chosen_method_element(ns::BYTESTREAMS).to_xml_in(ns::CLIENT)
                ));
            }
            let query = el.child("query", ns::BYTESTREAMS)?;
            if el.attr("type") == Some("get") {
                return Some(format!(
                    "<iq type='result'><query xmlns='http://jabber.org/protocol/bytestreams'>\
                     <streamhost jid='{PROXY}' host='127.0.0.1' port='{port}'/></query></iq>"
                ));
            }
            if query.child("activate", ns::BYTESTREAMS).is_some() {
                return Some("<iq type='result'/>".to_string());
            }
            Some(format!(
                "<iq type='result'><query xmlns='http://jabber.org/protocol/bytestreams'>\
                 <streamhost-used jid='{PROXY}'/></query></iq>"
            ))
        });
        let mut config = test_config();
        config.file_transfer_proxies = vec![Jid::parse(PROXY).unwrap()];
        config.bytestream_chunk_size = 3;
        let (session, _) = test_session_with(Some(conn.clone()), config);

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"0123456789").unwrap();
        let control = session
            .send_file(&Jid::parse(PEER).unwrap(), &path)
            .await
            .unwrap();
        let mut updates = control.updates().unwrap();

        let mut progress = Vec::new();
        loop {
            match updates.recv().await {
                Some(TransferUpdate::Finished) => break,
                Some(TransferUpdate::Progress { done, .. }) => progress.push(done),
                other => panic!("unexpected update {:?}", other),
            }
        }
        assert_eq!(progress, vec![3, 6, 9, 10]);

        let (name, data) = proxy.await.unwrap();
        assert_eq!(data, b"0123456789");
        let sent = conn.sent();
        let offer = SiOffer::from_element(sent[0].child("si", ns::SI).unwrap()).unwrap();
        assert_eq!(offer.methods, vec![ns::BYTESTREAMS.to_string(), ns::IBB.to_string()]);
        assert_eq!(name, socks5_destination(&offer.id, "some@one.org/foo", PEER));

        let activation = sent
            .iter()
            .filter_map(|el| el.child("query", ns::BYTESTREAMS))
            .find_map(|q| BytestreamQuery::from_element(q)?.activate)
            .unwrap();
        assert_eq!(activation, PEER);
        assert_eq!(session.active_transfers(), 0);
    }

    #[tokio::test]
    async fn test_send_without_streamhosts() {
        let conn = MockConn::new("some@one.org/foo");
        conn.respond_with(|el| {
            if el.child("si", ns::SI).is_some() {
                return Some(format!(
                    "<iq type='result'>{}</iq>",
                    chosen_method_element(ns::BYTESTREAMS).to_xml_in(ns::CLIENT)
                ));
            }
            Some(
                "<iq type='error'><error type='cancel'>\
                 <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
                    .to_string(),
            )
        });
        let mut config = test_config();
        config.file_transfer_proxies = vec![Jid::parse(PROXY).unwrap()];
        let (session, _) = test_session_with(Some(conn.clone()), config);

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"0123456789").unwrap();
        let control = session
            .send_file(&Jid::parse(PEER).unwrap(), &path)
            .await
            .unwrap();
        let mut updates = control.updates().unwrap();

        assert_eq!(
            updates.recv().await,
            Some(TransferUpdate::Error("No file transfer proxy is available".into()))
        );
        assert_eq!(session.active_transfers(), 0);
    }
}
