use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_shared::filetransfer::{chosen_method_element, IbbClose, SiOffer};
use parley_shared::{ClientIq, Jid, StanzaError};

use super::registry::{choose_recv_method, Method};
use super::FileTransferControl;
use crate::error::TransferError;
use crate::events::{Event, FileTransferAnswer, FileTransferRequest};
use crate::session::Session;

/// An inbound transfer, from the offer until the file is saved or dropped.
pub(crate) struct RecvContext {
    pub(crate) sid: String,
    /// Full address of the sender.
    pub(crate) peer: Jid,
    pub(crate) offer: SiOffer,
    pub(crate) control: FileTransferControl,
    method: Mutex<Option<Method>>,
    /// Present between acceptance and the end of the transfer.
    pub(crate) state: AsyncMutex<Option<RecvState>>,
    /// Fires when the transfer is over, whatever the outcome.
    pub(crate) done: CancellationToken,
}

impl RecvContext {
    fn new(peer: Jid, offer: SiOffer, control: FileTransferControl) -> Self {
        Self {
            sid: offer.id.clone(),
            peer,
            offer,
            control,
            method: Mutex::new(None),
            state: AsyncMutex::new(None),
            done: CancellationToken::new(),
        }
    }

    pub(crate) fn method(&self) -> Option<Method> {
        *self.method.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_method(&self, method: Method) {
        *self.method.lock().unwrap_or_else(PoisonError::into_inner) = Some(method);
    }

    pub(crate) fn is_from(&self, from: &str) -> bool {
        self.peer.to_string() == from
    }
}

/// Received data goes to a temporary file next to the destination, so the
/// final rename never crosses filesystems.
pub(crate) struct RecvState {
    destination: PathBuf,
    temp: NamedTempFile,
    file: File,
    pub(crate) received: u64,
    /// Next expected in-band sequence number.
    pub(crate) next_seq: u16,
}

impl RecvState {
    fn open(destination: PathBuf) -> io::Result<Self> {
        let dir = match destination.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = destination
            .file_name()
            .map(|n| format!("{}.", n.to_string_lossy()))
            .unwrap_or_default();
        let temp = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?;
        let file = File::from_std(temp.reopen()?);
        Ok(Self {
            destination,
            temp,
            file,
            received: 0,
            next_seq: 0,
        })
    }

    pub(crate) fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Append a chunk. Returns the total received so far.
    pub(crate) async fn write(&mut self, data: &[u8]) -> io::Result<u64> {
        self.file.write_all(data).await?;
        self.received += data.len() as u64;
        Ok(self.received)
    }

    /// Move the finished file into place. A failed rename keeps the
    /// temporary file on disk.
    async fn persist(self) -> io::Result<PathBuf> {
        let RecvState {
            destination,
            temp,
            mut file,
            ..
        } = self;
        file.flush().await?;
        drop(file);
        match temp.persist(&destination) {
            Ok(_) => Ok(destination),
            Err(e) => {
                if let Ok((_, path)) = e.file.keep() {
                    debug!(path = %path.display(), "Kept partial download");
                }
                Err(e.error)
            }
        }
    }
}

impl Session {
    pub(crate) fn recv_context(&self, sid: &str, from: &str) -> Option<Arc<RecvContext>> {
        self.transfers.recv.get(sid).filter(|ctx| ctx.is_from(from))
    }

    /// An `<si>` offer: register it, announce it and wait for the user.
    pub(crate) async fn receive_stream_initiation(self: &Arc<Self>, iq: ClientIq) {
        let Some(si) = iq.payload.as_ref() else {
            return;
        };
        let offer = match SiOffer::from_element(si) {
            Ok(offer) => offer,
            Err(e) => {
                self.warn(format!("Failed to parse stream initiation: {}", e));
                self.reply_error(&iq, StanzaError::bad_request()).await;
                return;
            }
        };
        let peer = match Jid::parse(&iq.from) {
            Ok(jid) if jid.resource().is_some() => jid,
            _ => {
                self.warn(format!(
                    "Stanza sender doesn't contain resource - this shouldn't happen: {}",
                    iq.from
                ));
                self.reply_error(&iq, StanzaError::bad_request()).await;
                return;
            }
        };

        let control = FileTransferControl::new(offer.file.size);
        let ctx = Arc::new(RecvContext::new(peer.clone(), offer, control.clone()));
        if !self.transfers.recv.insert(&ctx.sid, ctx.clone()) {
            self.warn(format!("Duplicate file transfer id {} from {}", ctx.sid, peer));
            self.reply_error(&iq, StanzaError::new("cancel", "conflict")).await;
            return;
        }

        info!(peer = %peer, sid = %ctx.sid, name = %ctx.offer.file.name, size = ctx.offer.file.size, "Incoming file transfer");
        let (answer, decision) = FileTransferAnswer::new();
        let file = &ctx.offer.file;
        self.publish(Event::FileTransfer(FileTransferRequest {
            peer,
            sid: ctx.sid.clone(),
            name: file.name.clone(),
            size: file.size,
            mime: ctx.offer.mime_type.clone(),
            date: file.date.clone(),
            description: file.desc.clone(),
            is_directory: ctx.offer.is_directory(),
            answer,
            control,
        }));

        tokio::spawn(self.clone().wait_for_acceptance(ctx, iq, decision));
    }

    async fn wait_for_acceptance(
        self: Arc<Self>,
        ctx: Arc<RecvContext>,
        iq: ClientIq,
        decision: oneshot::Receiver<Option<PathBuf>>,
    ) {
        let destination = match decision.await {
            Ok(Some(path)) => path,
            _ => {
                debug!(sid = %ctx.sid, "File transfer declined");
                self.reply_error(&iq, StanzaError::forbidden()).await;
                self.drop_receive(&ctx);
                return;
            }
        };

        let Some(method) = choose_recv_method(&ctx.offer.methods) else {
            ctx.control
                .report_error(TransferError::NoAcceptableMethod.to_string());
            self.reply_error(&iq, StanzaError::bad_request()).await;
            self.drop_receive(&ctx);
            return;
        };

        match RecvState::open(destination) {
            Ok(state) => *ctx.state.lock().await = Some(state),
            Err(e) => {
                warn!(sid = %ctx.sid, error = %e, "Failed to create temporary file");
                ctx.control.report_error(TransferError::TempFile.to_string());
                self.reply_error(&iq, StanzaError::forbidden()).await;
                self.drop_receive(&ctx);
                return;
            }
        }

        ctx.set_method(method);
        self.spawn_cancel_listener(ctx.clone());
        debug!(sid = %ctx.sid, method = ?method, "File transfer accepted");
        self.reply_result(&iq, Some(chosen_method_element(method.namespace())))
            .await;
    }

    fn drop_receive(&self, ctx: &Arc<RecvContext>) {
        self.transfers.recv.remove(&ctx.sid, ctx);
        ctx.done.cancel();
    }

    /// Watch the control handle until the transfer ends. A local cancel
    /// deletes the partial file and tells an in-band sender to stop. A
    /// local close drops everything without telling the sender.
    fn spawn_cancel_listener(self: &Arc<Self>, ctx: Arc<RecvContext>) {
        let session = self.clone();
        tokio::spawn(async move {
            let notify = tokio::select! {
                _ = ctx.done.cancelled() => return,
                _ = ctx.control.cancelled() => true,
                _ = ctx.control.closed() => false,
            };
            if !session.transfers.recv.remove(&ctx.sid, &ctx) {
                return;
            }
            ctx.done.cancel();
            ctx.state.lock().await.take();
            ctx.control.close_all();
            if notify {
                info!(sid = %ctx.sid, "File transfer cancelled");
            } else {
                info!(sid = %ctx.sid, "File transfer closed");
            }

            if notify && ctx.method() == Some(Method::Ibb) {
                let close = IbbClose {
                    sid: ctx.sid.clone(),
                };
                if let Err(e) = session
                    .send_iq(&ctx.peer.to_string(), "set", close.to_element())
                    .await
                {
                    debug!(sid = %ctx.sid, error = %e, "Failed to send in-band close");
                }
            }
        });
    }

    /// The sender says all data is in: rename the temporary file to its
    /// destination. A short or long file is discarded instead.
    pub(crate) async fn finish_receive(&self, ctx: &Arc<RecvContext>) {
        let expected = ctx.offer.file.expected_size();
        let received = ctx.state.lock().await.as_ref().map(|s| s.received);
        if let Some(received) = received {
            if expected != 0 && received != expected {
                debug!(sid = %ctx.sid, expected, received, "Received size doesn't match the offer");
                self.fail_receive(ctx, TransferError::IncorrectSize).await;
                return;
            }
        }
        if !self.transfers.recv.remove(&ctx.sid, ctx) {
            return;
        }
        ctx.done.cancel();
        let Some(state) = ctx.state.lock().await.take() else {
            return;
        };
        match state.persist().await {
            Ok(destination) => {
                info!(sid = %ctx.sid, path = %destination.display(), "File transfer finished");
                ctx.control.report_finished();
            }
            Err(e) => {
                warn!(sid = %ctx.sid, error = %e, "Failed to save received file");
                ctx.control.report_error(TransferError::SaveFinal.to_string());
            }
        }
    }

    /// Abandon a receive. The partial file is deleted.
    pub(crate) async fn fail_receive(&self, ctx: &Arc<RecvContext>, error: TransferError) {
        if !self.transfers.recv.remove(&ctx.sid, ctx) {
            return;
        }
        ctx.done.cancel();
        ctx.state.lock().await.take();
        warn!(sid = %ctx.sid, error = %error, "File transfer failed");
        ctx.control.report_error(error.to_string());
        ctx.control.close_all();
    }
}
