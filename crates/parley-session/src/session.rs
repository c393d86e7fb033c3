//! The account-level session object.
//!
//! A [`Session`] is always handled through an `Arc`: the read loop, the
//! timeout watcher and every file transfer task hold a clone of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use parley_net::{Conn, Cookie, Dialer};
use parley_roster::Roster;
use parley_shared::{Element, Jid, Stanza};

use crate::config::{Account, SessionConfig};
use crate::conversation::ConversationManager;
use crate::error::{Result, SessionError};
use crate::events::{Event, EventBus, LogLevel, PeerEventKind, SubscriptionId};
use crate::filetransfer::Transfers;
use crate::rooms::Rooms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// One account's connection to its server, with everything that lives as
/// long as the connection.
pub struct Session {
    /// The account as configured.
    pub(crate) account: Account,
    /// Bare address of the account, parsed once.
    pub(crate) jid: Jid,
    pub(crate) config: SessionConfig,
    /// Opens the transport on `connect`.
    pub(crate) dialer: Arc<dyn Dialer>,
    /// Encrypted conversations, keyed by peer.
    pub(crate) conversations: Arc<dyn ConversationManager>,
    /// Connection state. Every transition happens under this lock.
    pub(crate) status: Mutex<ConnStatus>,
    /// The live transport, present only while connected.
    pub(crate) conn: RwLock<Option<Arc<dyn Conn>>>,
    /// Outstanding requests and their deadlines.
    pub(crate) timeouts: Arc<Mutex<HashMap<Cookie, Instant>>>,
    /// Contacts, cleared when the connection ends.
    pub(crate) roster: Roster,
    pub(crate) bus: Arc<EventBus>,
    /// In-flight file transfers in both directions.
    pub(crate) transfers: Transfers,
    /// Occupants of joined multi-user chat rooms.
    pub(crate) rooms: Rooms,
}

impl Session {
    pub fn new(
        account: Account,
        config: SessionConfig,
        dialer: Arc<dyn Dialer>,
        conversations: Arc<dyn ConversationManager>,
    ) -> Result<Arc<Self>> {
        let jid = Jid::parse(&account.account)?.bare();
        let bus = Arc::new(EventBus::new(config.event_buffer));
        Ok(Arc::new(Self {
            account,
            jid,
            config,
            dialer,
            conversations,
            status: Mutex::new(ConnStatus::Disconnected),
            conn: RwLock::new(None),
            timeouts: Arc::new(Mutex::new(HashMap::new())),
            roster: Roster::new(),
            bus,
            transfers: Transfers::default(),
            rooms: Rooms::new(),
        }))
    }

    /// Bare address of the account.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    pub fn status(&self) -> ConnStatus {
        *self.status_lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnStatus::Connected
    }

    pub(crate) fn status_lock(&self) -> MutexGuard<'_, ConnStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, status: ConnStatus) {
        *self.status_lock() = status;
    }

    pub(crate) fn timeouts_lock(&self) -> MutexGuard<'_, HashMap<Cookie, Instant>> {
        self.timeouts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The open transport, if any.
    pub fn connection(&self) -> Option<Arc<dyn Conn>> {
        self.conn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn conn(&self) -> Result<Arc<dyn Conn>> {
        self.connection().ok_or(SessionError::NotConnected)
    }

    pub(crate) fn set_conn(&self, conn: Option<Arc<dyn Conn>>) {
        *self.conn.write().unwrap_or_else(PoisonError::into_inner) = conn;
    }

    // -- Events ------------------------------------------------------------

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<Event>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id)
    }

    pub fn publish(&self, event: Event) {
        self.bus.publish(event)
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!(account = %self.jid, "{}", message),
            LogLevel::Warn => warn!(account = %self.jid, "{}", message),
            LogLevel::Alert => error!(account = %self.jid, "{}", message),
        }
        self.publish(Event::Log { level, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into())
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into())
    }

    pub fn alert(&self, message: impl Into<String>) {
        self.log(LogLevel::Alert, message.into())
    }

    // -- Requests ----------------------------------------------------------

    /// Send an IQ request. While connected its deadline is recorded in the
    /// timeout table; once it passes the request is forgotten and the reply
    /// channel closes.
    ///
    /// A reply publishes [`PeerEventKind::IqReceived`] before it is handed
    /// over.
    pub async fn send_iq(
        &self,
        to: &str,
        kind: &str,
        payload: Element,
    ) -> Result<(oneshot::Receiver<Stanza>, Cookie)> {
        self.send_iq_with_deadline(to, kind, payload, self.config.iq_timeout)
            .await
    }

    /// [`Session::send_iq`] with its own deadline instead of `iq_timeout`.
    pub(crate) async fn send_iq_with_deadline(
        &self,
        to: &str,
        kind: &str,
        payload: Element,
        deadline: Duration,
    ) -> Result<(oneshot::Receiver<Stanza>, Cookie)> {
        let conn = self.conn()?;
        let (routed, cookie) = conn.send_iq(to, kind, payload).await?;
        {
            let status = self.status_lock();
            if *status == ConnStatus::Connected {
                self.timeouts_lock().insert(cookie, Instant::now() + deadline);
            }
        }

        let (forward, reply) = oneshot::channel();
        let bus = self.bus.clone();
        let timeouts = self.timeouts.clone();
        let addressee = Jid::parse(to).unwrap_or_else(|_| self.jid.clone());
        tokio::spawn(async move {
            let Ok(stanza) = routed.await else {
                return;
            };
            timeouts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&cookie);
            let from = match &stanza {
                Stanza::Iq(iq) => Jid::parse(&iq.from).ok(),
                _ => None,
            };
            bus.publish(Event::Peer {
                kind: PeerEventKind::IqReceived,
                from: from.unwrap_or(addressee),
            });
            let _ = forward.send(stanza);
        });
        Ok((reply, cookie))
    }

    pub fn pending_requests(&self) -> usize {
        self.timeouts_lock().len()
    }

    // -- Conversations -----------------------------------------------------

    /// Send a chat message, through the conversation with `peer` when there
    /// is one.
    pub async fn send_message(&self, peer: &Jid, body: &str) -> Result<()> {
        match self.conversations.get_conversation_with(peer) {
            Some(conv) => {
                conv.send(body.as_bytes()).await?;
            }
            None => self.conn()?.send_message(peer, body).await?,
        }
        Ok(())
    }

    pub async fn start_encrypted_chat(&self, peer: &Jid) -> Result<()> {
        let (conv, _) = self.conversations.ensure_conversation_with(peer);
        conv.start_encrypted_chat().await?;
        Ok(())
    }

    pub async fn end_encrypted_chat(&self, peer: &Jid) -> Result<()> {
        let conv = self
            .conversations
            .get_conversation_with(peer)
            .ok_or_else(|| SessionError::NoConversation(peer.clone()))?;
        conv.end_encrypted_chat().await?;
        Ok(())
    }

    pub async fn start_smp(&self, peer: &Jid, question: &str, answer: &str) {
        let Some(conv) = self.conversations.get_conversation_with(peer) else {
            self.alert("error: tried to start SMP when a conversation does not exist");
            return;
        };
        if let Err(e) = conv.start_smp(question, answer).await {
            self.alert(format!("error: cannot start SMP: {}", e));
        }
    }

    pub async fn finish_smp(&self, peer: &Jid, answer: &str) {
        let Some(conv) = self.conversations.get_conversation_with(peer) else {
            self.alert("error: tried to finish SMP when a conversation does not exist");
            return;
        };
        if let Err(e) = conv.finish_smp(answer).await {
            self.alert(format!("error: cannot finish SMP: {}", e));
        }
    }

    pub async fn abort_smp(&self, peer: &Jid) {
        let Some(conv) = self.conversations.get_conversation_with(peer) else {
            self.alert("error: tried to abort SMP when a conversation does not exist");
            return;
        };
        if let Err(e) = conv.abort_smp().await {
            self.alert(format!("error: cannot abort SMP: {}", e));
        }
    }
}
