//! Per-session event bus.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: when a
//! subscriber's queue is full the event is dropped for that subscriber only,
//! and subscribers whose receiver is gone are pruned.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use parley_roster::PeerError;
use parley_shared::Jid;

use crate::filetransfer::FileTransferControl;
use crate::rooms::Occupant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEventKind {
    SubscriptionRequest,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    /// A reply to one of our IQ requests arrived.
    IqReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnected,
    /// The connection dropped without a local disconnect.
    ConnectionLost,
}

/// Single-use answer slot of an inbound file transfer.
#[derive(Debug, Clone)]
pub struct FileTransferAnswer {
    slot: Arc<Mutex<Option<oneshot::Sender<Option<PathBuf>>>>>,
}

impl FileTransferAnswer {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Option<PathBuf>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    fn answer(&self, value: Option<PathBuf>) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Accept and save the payload at `destination`. Returns `false` if the
    /// transfer was already answered.
    pub fn accept(&self, destination: impl Into<PathBuf>) -> bool {
        self.answer(Some(destination.into()))
    }

    pub fn decline(&self) -> bool {
        self.answer(None)
    }
}

/// An inbound file transfer waiting for a decision.
#[derive(Debug, Clone)]
pub struct FileTransferRequest {
    /// Full address of the sender.
    pub peer: Jid,
    /// Stream id chosen by the sender.
    pub sid: String,
    /// File name as offered, without any directory.
    pub name: String,
    /// Announced size in bytes, zero when unknown.
    pub size: u64,
    pub mime: String,
    /// Modification date as sent by the peer, usually RFC 3339.
    pub date: String,
    pub description: String,
    /// The offer is a directory packed as a single archive.
    pub is_directory: bool,
    /// Accept with a destination path or decline. Dropping it declines.
    pub answer: FileTransferAnswer,
    /// Progress and cancellation of the transfer once accepted.
    pub control: FileTransferControl,
}

#[derive(Debug, Clone)]
pub enum Event {
    Log {
        level: LogLevel,
        message: String,
    },
    Connection(ConnectionEvent),
    /// The roster was (re)loaded from the server.
    RosterReceived,
    Peer {
        kind: PeerEventKind,
        from: Jid,
    },
    PeerError {
        from: Jid,
        error: PeerError,
    },
    Presence {
        from: Jid,
        gone: bool,
        show: String,
        status: String,
    },
    Message {
        from: Jid,
        body: String,
        encrypted: bool,
        timestamp: DateTime<Utc>,
    },
    FileTransfer(FileTransferRequest),
    MucOccupantJoined {
        room: Jid,
        occupant: Occupant,
    },
    MucOccupantUpdated {
        room: Jid,
        occupant: Occupant,
    },
    MucOccupantLeft {
        room: Jid,
        nickname: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::Sender<Event>)>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = id.0, "Dropping event for slow subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(message: &str) -> Event {
        Event::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    fn message_of(event: Event) -> String {
        match event {
            Event::Log { message, .. } => message,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let bus = EventBus::new(10);
        let (_, mut a) = bus.subscribe();
        let (_, mut b) = bus.subscribe();
        bus.publish(log("one"));
        bus.publish(log("two"));

        for rx in [&mut a, &mut b] {
            assert_eq!(message_of(rx.recv().await.unwrap()), "one");
            assert_eq!(message_of(rx.recv().await.unwrap()), "two");
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block() {
        let bus = EventBus::new(1);
        let (_, mut slow) = bus.subscribe();
        bus.publish(log("kept"));
        bus.publish(log("dropped"));
        assert_eq!(message_of(slow.recv().await.unwrap()), "kept");
        assert!(slow.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let (_, rx) = bus.subscribe();
        let (id, _keep) = bus.subscribe();
        drop(rx);
        bus.publish(log("x"));
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_answer_is_single_use() {
        let (answer, rx) = FileTransferAnswer::new();
        let ui = answer.clone();
        assert!(ui.accept("/tmp/file"));
        assert!(!answer.decline());
        assert_eq!(rx.await.unwrap(), Some(PathBuf::from("/tmp/file")));
    }
}
