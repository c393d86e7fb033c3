//! Handle shared between a transfer and the code presenting it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Progress notifications for one transfer. `Finished` and `Error` are
/// terminal and sent at most once between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    Progress { done: u64, total: u64 },
    Finished,
    Error(String),
}

#[derive(Debug)]
struct ControlInner {
    cancel: CancellationToken,
    close: CancellationToken,
    updates: mpsc::UnboundedSender<TransferUpdate>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransferUpdate>>>,
    terminated: AtomicBool,
    total: AtomicU64,
}

/// Cloneable control handle of a file transfer.
///
/// Presentation code cancels through it and reads [`TransferUpdate`]s from
/// it; the engine reports through it without ever blocking.
#[derive(Debug, Clone)]
pub struct FileTransferControl {
    inner: Arc<ControlInner>,
}

impl FileTransferControl {
    pub fn new(total: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ControlInner {
                cancel: CancellationToken::new(),
                close: CancellationToken::new(),
                updates: tx,
                receiver: Mutex::new(Some(rx)),
                terminated: AtomicBool::new(false),
                total: AtomicU64::new(total),
            }),
        }
    }

    /// Take the update stream. Only the first caller gets it.
    pub fn updates(&self) -> Option<mpsc::UnboundedReceiver<TransferUpdate>> {
        self.inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Ask for the transfer to stop at the next chunk boundary.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Close all I/O belonging to the transfer without further protocol
    /// traffic.
    pub fn close_all(&self) {
        self.inner.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close.is_cancelled()
    }

    pub async fn closed(&self) {
        self.inner.close.cancelled().await
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn report_progress(&self, done: u64) {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.updates.send(TransferUpdate::Progress {
            done,
            total: self.total(),
        });
    }

    pub fn report_error(&self, message: impl Into<String>) {
        self.terminate(TransferUpdate::Error(message.into()));
    }

    pub fn report_finished(&self) {
        self.terminate(TransferUpdate::Finished);
    }

    fn terminate(&self, update: TransferUpdate) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_terminal_update() {
        let control = FileTransferControl::new(10);
        let mut updates = control.updates().unwrap();
        assert!(control.updates().is_none());

        control.report_progress(4);
        control.report_error("boom");
        control.report_finished();
        control.report_progress(10);

        assert_eq!(
            updates.recv().await,
            Some(TransferUpdate::Progress { done: 4, total: 10 })
        );
        assert_eq!(updates.recv().await, Some(TransferUpdate::Error("boom".into())));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_shared_between_clones() {
        let control = FileTransferControl::new(0);
        let ui = control.clone();
        ui.cancel();
        assert!(control.is_cancelled());
        control.cancelled().await;
        assert!(!control.is_closed());
    }
}
