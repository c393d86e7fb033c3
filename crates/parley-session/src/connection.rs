//! Connection lifecycle: connect, the stanza read loop, the request timeout
//! watcher and the two ways a connection ends.

use std::sync::{Arc, PoisonError};
use std::time::Instant;

use tracing::{debug, info};

use parley_net::Conn;
use parley_roster::Peer;
use parley_shared::constants::ns;
use parley_shared::{Element, IqType, RosterEntry, Stanza};

use crate::error::{Result, SessionError};
use crate::events::{ConnectionEvent, Event};
use crate::session::{ConnStatus, Session};

impl Session {
    /// Dial and authenticate. Only allowed from `Disconnected`.
    ///
    /// On success the read loop and the timeout watcher are spawned, the
    /// roster is requested and initial presence is sent.
    pub async fn connect(self: &Arc<Self>, password: &str) -> Result<()> {
        {
            let mut status = self.status_lock();
            if *status != ConnStatus::Disconnected {
                return Err(SessionError::InvalidState(*status));
            }
            *status = ConnStatus::Connecting;
        }
        self.publish(Event::Connection(ConnectionEvent::Connecting));

        let conn = match self.dialer.dial(&self.jid, password).await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_status(ConnStatus::Disconnected);
                self.alert(format!("Failed to connect: {}", e));
                self.publish(Event::Connection(ConnectionEvent::Disconnected));
                return Err(e.into());
            }
        };

        self.set_conn(Some(conn.clone()));
        self.set_status(ConnStatus::Connected);
        info!(account = %self.jid, bound = %conn.jid(), "Connected");
        self.publish(Event::Connection(ConnectionEvent::Connected));

        tokio::spawn(self.clone().watch_stanzas(conn.clone()));
        tokio::spawn(self.clone().watch_timeout());
        tokio::spawn(self.clone().request_roster());

        if let Err(e) = conn.send_presence("", "", "", "").await {
            self.warn(format!("Failed to send initial presence: {}", e));
        }
        Ok(())
    }

    /// Close the connection on request. Clears the timeout table and the
    /// roster.
    pub async fn disconnect(&self) {
        {
            let mut status = self.status_lock();
            if *status != ConnStatus::Connected {
                return;
            }
            *status = ConnStatus::Disconnecting;
        }

        let conn = self.conn.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error closing connection");
            }
        }

        {
            let mut status = self.status_lock();
            self.clear_connection_state();
            *status = ConnStatus::Disconnected;
        }
        self.publish(Event::Connection(ConnectionEvent::Disconnected));
    }

    /// The transport dropped under a live session.
    pub(crate) fn connection_lost(&self, conn: &Arc<dyn Conn>) {
        {
            let mut status = self.status_lock();
            if *status != ConnStatus::Connected {
                return;
            }
            let current = self.connection();
            if !current.is_some_and(|c| Arc::ptr_eq(&c, conn)) {
                return;
            }
            self.set_conn(None);
            self.clear_connection_state();
            *status = ConnStatus::Disconnected;
        }
        self.publish(Event::Connection(ConnectionEvent::ConnectionLost));
    }

    fn clear_connection_state(&self) {
        self.timeouts_lock().clear();
        self.roster.clear();
        self.rooms.clear();
    }

    /// Read stanzas until the stream ends or a fatal error occurs.
    pub async fn watch_stanzas(self: Arc<Self>, conn: Arc<dyn Conn>) {
        loop {
            match conn.next().await {
                Ok(stanza) => {
                    if !self.handle_stanza(stanza).await {
                        break;
                    }
                }
                Err(e) => {
                    if self.is_connected() {
                        self.alert(format!("error reading XMPP message: {}", e));
                    }
                    break;
                }
            }
        }
        self.connection_lost(&conn);
    }

    /// Forget requests whose deadline has passed, until the session leaves
    /// `Connected`.
    pub async fn watch_timeout(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.timeout_check_interval);
        loop {
            tick.tick().await;
            if !self.is_connected() {
                return;
            }
            self.expire_requests(Instant::now());
        }
    }

    pub(crate) fn expire_requests(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut timeouts = self.timeouts_lock();
            let expired: Vec<_> = timeouts
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(cookie, _)| *cookie)
                .collect();
            for cookie in &expired {
                timeouts.remove(cookie);
            }
            expired
        };
        if let Some(conn) = self.connection() {
            for cookie in &expired {
                debug!(cookie = %cookie, "Request timed out");
                conn.cancel(*cookie);
            }
        }
        expired.len()
    }

    /// Ask the server for the roster and merge the answer.
    pub(crate) async fn request_roster(self: Arc<Self>) {
        let reply = match self.send_iq("", "get", Element::new("query", ns::ROSTER)).await {
            Ok((reply, _)) => reply,
            Err(e) => {
                self.warn(format!("Failed to request roster: {}", e));
                return;
            }
        };

        match reply.await {
            Ok(Stanza::Iq(iq)) if iq.kind == IqType::Result => {
                let entries = iq
                    .payload
                    .as_ref()
                    .map(RosterEntry::list_from_query)
                    .unwrap_or_default();
                for entry in entries.iter().filter(|e| e.subscription != "remove") {
                    match Peer::from_entry(entry, &self.jid.to_string()) {
                        Ok(peer) => {
                            self.roster.add_or_replace(peer);
                        }
                        Err(e) => self.warn(format!("Ignoring roster item {}: {}", entry.jid, e)),
                    }
                }
                self.publish(Event::RosterReceived);
            }
            Ok(_) => self.warn("Failed to request roster: server returned an error"),
            Err(_) => self.warn("Failed to request roster: no reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::LogLevel;
    use crate::test_support::{drain, test_session, MockConn, MockDialer};
    use parley_shared::Jid;

    #[tokio::test]
    async fn test_connect_requests_roster_and_sends_presence() {
        let conn = MockConn::new("some@one.org/foo");
        conn.respond_with(|req| {
            req.child("query", ns::ROSTER).map(|_| {
                "<iq type='result'><query xmlns='jabber:iq:roster'>\
                 <item jid='romeo@example.net' subscription='both'/></query></iq>"
                    .to_string()
            })
        });
        let session = crate::test_support::test_session_dialing(MockDialer::ok(conn.clone()));
        let (_, mut events) = session.subscribe();

        session.connect("secret").await.unwrap();
        assert_eq!(session.status(), ConnStatus::Connected);

        let mut roster_received = false;
        for _ in 0..50 {
            if events.try_recv().map(|e| matches!(e, Event::RosterReceived)).unwrap_or(false) {
                roster_received = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(roster_received);
        assert!(session.roster().get(&Jid::parse("romeo@example.net").unwrap()).is_some());
        assert!(conn.sent().iter().any(|el| el.name == "presence" && el.attrs.is_empty()));

        assert!(matches!(
            session.connect("again").await,
            Err(SessionError::InvalidState(ConnStatus::Connected))
        ));
    }

    #[tokio::test]
    async fn test_failed_dial_returns_to_disconnected() {
        let session = crate::test_support::test_session_dialing(MockDialer::failing("bad password"));
        let (_, mut events) = session.subscribe();

        assert!(session.connect("wrong").await.is_err());
        assert_eq!(session.status(), ConnStatus::Disconnected);

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Log { level: LogLevel::Alert, message } if message.starts_with("Failed to connect")
        )));
    }

    #[tokio::test]
    async fn test_disconnect_clears_state() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        session.set_status(ConnStatus::Connected);
        session.roster().add_or_replace(Peer::new(&Jid::parse("a@b.org").unwrap()));
        session.send_iq("", "get", Element::new("ping", ns::PING)).await.unwrap();
        let (_, mut events) = session.subscribe();

        session.disconnect().await;

        assert_eq!(session.status(), ConnStatus::Disconnected);
        assert!(session.roster().is_empty());
        assert_eq!(session.pending_requests(), 0);
        assert!(session.connection().is_none());
        assert!(conn.is_closed());
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::Connection(ConnectionEvent::Disconnected))));
    }

    #[tokio::test]
    async fn test_stream_error_is_fatal() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        session.set_status(ConnStatus::Connected);
        session.roster().add_or_replace(Peer::new(&Jid::parse("a@b.org").unwrap()));
        let (_, mut events) = session.subscribe();

        conn.push(
            "<stream:error xmlns:stream='http://etherx.jabber.org/streams'>\
             <conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        );
        conn.push("<presence from='x@y.org/z'/>");
        session.clone().watch_stanzas(conn.clone()).await;

        assert_eq!(session.status(), ConnStatus::Disconnected);
        assert!(session.roster().is_empty());
        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Log { level: LogLevel::Alert, message }
                if message == "Exiting in response to fatal error from server: {urn:ietf:params:xml:ns:xmpp-streams conflict}"
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Connection(ConnectionEvent::ConnectionLost))));
        // The presence after the stream error was never processed.
        assert!(!events.iter().any(|e| matches!(e, Event::Presence { .. })));
    }

    #[tokio::test]
    async fn test_read_error_while_connected_is_connection_lost() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        session.set_status(ConnStatus::Connected);
        let (_, mut events) = session.subscribe();

        conn.end();
        session.clone().watch_stanzas(conn.clone()).await;

        assert_eq!(session.status(), ConnStatus::Disconnected);
        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Log { level: LogLevel::Alert, message } if message == "error reading XMPP message: stream closed"
        )));
    }

    #[tokio::test]
    async fn test_read_end_while_disconnected_is_quiet() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        let (_, mut events) = session.subscribe();
        conn.push("<message xmlns='jabber:client' from='a@b.org/c'/>");
        conn.end();
        session.clone().watch_stanzas(conn.clone()).await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_expired_requests_are_forgotten() {
        let conn = MockConn::new("some@one.org/foo");
        let session = test_session(Some(conn.clone()));
        session.set_status(ConnStatus::Connected);
        let (reply, cookie) = session
            .send_iq("", "get", Element::new("ping", ns::PING))
            .await
            .unwrap();

        assert_eq!(session.expire_requests(Instant::now()), 0);
        let later = Instant::now() + session.config().iq_timeout + Duration::from_secs(1);
        assert_eq!(session.expire_requests(later), 1);
        assert_eq!(session.pending_requests(), 0);
        assert!(conn.was_cancelled(cookie));
        assert!(reply.await.is_err());
        assert_eq!(session.status(), ConnStatus::Connected);
    }

    #[tokio::test]
    async fn test_watch_timeout_stops_when_not_connected() {
        let session = test_session(None);
        tokio::time::timeout(Duration::from_secs(1), session.clone().watch_timeout())
            .await
            .unwrap();
    }
}
