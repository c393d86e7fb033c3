//! In-memory doubles for the transport and the conversation layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use parley_net::{Conn, Cookie, Dialer, NetError};
use parley_shared::constants::ns;
use parley_shared::stanza::iq_element;
use parley_shared::{Element, Jid, Stanza};

use crate::config::{Account, SessionConfig};
use crate::conversation::{Conversation, ConversationError, ConversationManager};
use crate::events::Event;
use crate::session::Session;

type Responder = Box<dyn FnMut(&Element) -> Option<String> + Send>;

/// Parse a stanza the way the stream reader would.
pub fn stanza(xml: &str) -> Stanza {
    Stanza::from_element(Element::parse_in(xml, ns::CLIENT).unwrap())
}

/// A stream initiation offer of an 11 byte `test.txt` from
/// `romeo@example.net/orchard`.
pub fn si_offer(sid: &str, methods: &[&str]) -> String {
    let options: String = methods
        .iter()
        .map(|m| format!("<option><value>{}</value></option>", m))
        .collect();
    format!(
        "<iq type='set' id='offer-{sid}' from='romeo@example.net/orchard' to='some@one.org/foo'>\
         <si xmlns='http://jabber.org/protocol/si' id='{sid}' mime-type='text/plain' \
         profile='http://jabber.org/protocol/si/profile/file-transfer'>\
         <file xmlns='http://jabber.org/protocol/si/profile/file-transfer' name='test.txt' size='11'/>\
         <feature xmlns='http://jabber.org/protocol/feature-neg'>\
         <x xmlns='jabber:x:data' type='form'>\
         <field var='stream-method' type='list-single'>{options}</field>\
         </x></feature></si></iq>"
    )
}

pub struct MockConn {
    jid: Jid,
    inbound_tx: mpsc::UnboundedSender<Option<Stanza>>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Option<Stanza>>>,
    sent: Mutex<Vec<Element>>,
    pending: Mutex<HashMap<Cookie, oneshot::Sender<Stanza>>>,
    cancelled: Mutex<Vec<Cookie>>,
    responder: Mutex<Option<Responder>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl MockConn {
    pub fn new(jid: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            jid: Jid::parse(jid).unwrap(),
            inbound_tx: tx,
            inbound_rx: AsyncMutex::new(rx),
            sent: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue an inbound stanza for `next`.
    pub fn push(&self, xml: &str) {
        let _ = self.inbound_tx.send(Some(stanza(xml)));
    }

    /// End the inbound stream.
    pub fn end(&self) {
        let _ = self.inbound_tx.send(None);
    }

    /// Answer IQ requests as they are sent. Returning `None` leaves the
    /// request pending.
    pub fn respond_with<F>(&self, f: F)
    where
        F: FnMut(&Element) -> Option<String> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Element> {
        self.sent.lock().unwrap().clone()
    }

    pub fn pending(&self) -> Vec<Cookie> {
        self.pending.lock().unwrap().keys().copied().collect()
    }

    /// Deliver `xml` as the reply to an outstanding request.
    pub fn reply(&self, cookie: Cookie, xml: &str) -> bool {
        match self.pending.lock().unwrap().remove(&cookie) {
            Some(tx) => tx.send(stanza(xml)).is_ok(),
            None => false,
        }
    }

    pub fn was_cancelled(&self, cookie: Cookie) -> bool {
        self.cancelled.lock().unwrap().contains(&cookie)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn write(&self, el: Element) -> parley_net::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NetError::Other("write failed".into()));
        }
        self.sent.lock().unwrap().push(el);
        Ok(())
    }
}

#[async_trait]
impl Conn for MockConn {
    fn jid(&self) -> &Jid {
        &self.jid
    }

    async fn next(&self) -> parley_net::Result<Stanza> {
        match self.inbound_rx.lock().await.recv().await {
            Some(Some(stanza)) => Ok(stanza),
            _ => Err(NetError::StreamClosed),
        }
    }

    async fn send_element(&self, el: Element) -> parley_net::Result<()> {
        self.write(el)
    }

    async fn send_iq(
        &self,
        to: &str,
        kind: &str,
        payload: Element,
    ) -> parley_net::Result<(oneshot::Receiver<Stanza>, Cookie)> {
        let cookie = Cookie::random();
        let el = iq_element(to, kind, &cookie.to_string(), Some(payload));
        self.write(el.clone())?;

        let (tx, rx) = oneshot::channel();
        let answer = self.responder.lock().unwrap().as_mut().and_then(|f| f(&el));
        match answer {
            Some(xml) => {
                let _ = tx.send(stanza(&xml));
            }
            None => {
                self.pending.lock().unwrap().insert(cookie, tx);
            }
        }
        Ok((rx, cookie))
    }

    fn cancel(&self, cookie: Cookie) -> bool {
        self.cancelled.lock().unwrap().push(cookie);
        self.pending.lock().unwrap().remove(&cookie).is_some()
    }

    async fn close(&self) -> parley_net::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockDialer {
    conn: Option<Arc<MockConn>>,
    error: String,
}

impl MockDialer {
    pub fn ok(conn: Arc<MockConn>) -> Arc<Self> {
        Arc::new(Self {
            conn: Some(conn),
            error: String::new(),
        })
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            conn: None,
            error: error.to_string(),
        })
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _account: &Jid, _password: &str) -> parley_net::Result<Arc<dyn Conn>> {
        match &self.conn {
            Some(conn) => Ok(conn.clone() as Arc<dyn Conn>),
            None => Err(NetError::Auth(self.error.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    Echo,
    Swallow,
    Fail,
}

pub struct MockConversation {
    encrypted: AtomicBool,
    mode: Mutex<ReceiveMode>,
    received: Mutex<Vec<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockConversation {
    fn new() -> Self {
        Self {
            encrypted: AtomicBool::new(false),
            mode: Mutex::new(ReceiveMode::Echo),
            received: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_encrypted(&self, encrypted: bool) {
        self.encrypted.store(encrypted, Ordering::SeqCst);
    }

    pub fn is_encrypted_now(&self) -> bool {
        self.encrypted.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: ReceiveMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Conversation for MockConversation {
    fn receive(&self, message: &[u8]) -> Result<Vec<u8>, ConversationError> {
        self.received.lock().unwrap().push(message.to_vec());
        match *self.mode.lock().unwrap() {
            ReceiveMode::Echo => Ok(message.to_vec()),
            ReceiveMode::Swallow => Ok(Vec::new()),
            ReceiveMode::Fail => Err(ConversationError("bad data".into())),
        }
    }

    fn is_encrypted(&self) -> bool {
        self.is_encrypted_now()
    }

    async fn send(&self, message: &[u8]) -> Result<u64, ConversationError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.to_vec());
        Ok(sent.len() as u64)
    }

    async fn start_encrypted_chat(&self) -> Result<(), ConversationError> {
        self.set_encrypted(true);
        Ok(())
    }

    async fn end_encrypted_chat(&self) -> Result<(), ConversationError> {
        self.set_encrypted(false);
        Ok(())
    }

    async fn start_smp(&self, _question: &str, _answer: &str) -> Result<(), ConversationError> {
        Ok(())
    }

    async fn finish_smp(&self, _answer: &str) -> Result<(), ConversationError> {
        Ok(())
    }

    async fn abort_smp(&self) -> Result<(), ConversationError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MockConversations {
    conversations: Mutex<HashMap<Jid, Arc<MockConversation>>>,
}

impl MockConversations {
    pub fn get(&self, peer: &Jid) -> Option<Arc<MockConversation>> {
        self.conversations.lock().unwrap().get(peer).cloned()
    }

    /// The conversation with `peer`, created if needed.
    pub fn ensure(&self, peer: &Jid) -> Arc<MockConversation> {
        self.conversations
            .lock()
            .unwrap()
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(MockConversation::new()))
            .clone()
    }
}

impl ConversationManager for MockConversations {
    fn ensure_conversation_with(&self, peer: &Jid) -> (Arc<dyn Conversation>, bool) {
        let created = self.get(peer).is_none();
        (self.ensure(peer) as Arc<dyn Conversation>, created)
    }

    fn get_conversation_with(&self, peer: &Jid) -> Option<Arc<dyn Conversation>> {
        self.get(peer).map(|c| c as Arc<dyn Conversation>)
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        timeout_check_interval: Duration::from_millis(10),
        ibb_send_interval: Duration::ZERO,
        bytestream_connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

/// A session for `some@one.org` using `conn` as its transport. The status is
/// left `Disconnected`; tests that need `Connected` set it themselves.
pub fn test_session(conn: Option<Arc<MockConn>>) -> Arc<Session> {
    test_session_with(conn, test_config()).0
}

pub fn test_session_with(
    conn: Option<Arc<MockConn>>,
    config: SessionConfig,
) -> (Arc<Session>, Arc<MockConversations>) {
    let conversations = Arc::new(MockConversations::default());
    let session = Session::new(
        Account::new("some@one.org"),
        config,
        MockDialer::failing("no dialing in tests"),
        conversations.clone(),
    )
    .unwrap();
    if let Some(conn) = conn {
        session.set_conn(Some(conn as Arc<dyn Conn>));
    }
    (session, conversations)
}

pub fn test_session_dialing(dialer: Arc<MockDialer>) -> Arc<Session> {
    Session::new(
        Account::new("some@one.org"),
        test_config(),
        dialer,
        Arc::new(MockConversations::default()),
    )
    .unwrap()
}

pub fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `condition` until it holds or a second has passed.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
