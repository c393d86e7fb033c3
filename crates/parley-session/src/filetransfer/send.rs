use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::constants::ns;
use parley_shared::filetransfer::{parse_chosen_method, FileMeta, SiOffer};
use parley_shared::{Element, IqType, Jid, Stanza};

use super::registry::{send_methods, Method};
use super::wrap::{PassThrough, SendWrapper};
use super::FileTransferControl;
use crate::error::{Result, TransferError};
use crate::session::Session;

/// An outbound transfer.
pub(crate) struct SendContext {
    pub(crate) sid: String,
    pub(crate) peer: Jid,
    pub(crate) path: PathBuf,
    pub(crate) size: u64,
    pub(crate) control: FileTransferControl,
    they_want_to_cancel: AtomicBool,
    /// Taken by whichever stream method ends up sending.
    wrapper: Mutex<Option<Box<dyn SendWrapper>>>,
}

impl SendContext {
    pub(crate) fn is_to(&self, from: &str) -> bool {
        self.peer.to_string() == from
    }

    pub(crate) fn set_they_want_to_cancel(&self) {
        self.they_want_to_cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn they_want_to_cancel(&self) -> bool {
        self.they_want_to_cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn we_want_to_cancel(&self) -> bool {
        self.control.is_cancelled()
    }

    pub(crate) fn take_wrapper(&self) -> Box<dyn SendWrapper> {
        self.wrapper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| Box::new(PassThrough))
    }
}

impl Session {
    /// Offer the file at `path` to `peer` (a full address) and send it once
    /// accepted. Progress and the outcome are reported through the returned
    /// handle.
    pub async fn send_file(self: &Arc<Self>, peer: &Jid, path: impl AsRef<Path>) -> Result<FileTransferControl> {
        self.send_file_with(peer, path, Box::new(PassThrough)).await
    }

    /// [`Session::send_file`], passing the file content through `wrapper`
    /// on its way out.
    pub async fn send_file_with(
        self: &Arc<Self>,
        peer: &Jid,
        path: impl AsRef<Path>,
        wrapper: Box<dyn SendWrapper>,
    ) -> Result<FileTransferControl> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await.map_err(TransferError::Io)?;
        if !metadata.is_file() {
            return Err(TransferError::NotAFile(path).into());
        }
        self.conn()?;

        let control = FileTransferControl::new(metadata.len());
        let ctx = Arc::new(SendContext {
            sid: Uuid::new_v4().to_string(),
            peer: peer.clone(),
            path,
            size: metadata.len(),
            control: control.clone(),
            they_want_to_cancel: AtomicBool::new(false),
            wrapper: Mutex::new(Some(wrapper)),
        });
        self.transfers.send.insert(&ctx.sid, ctx.clone());

        let date = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .unwrap_or_default();
        info!(peer = %peer, sid = %ctx.sid, size = ctx.size, "Offering file");
        tokio::spawn(self.clone().offer_file(ctx, date));
        Ok(control)
    }

    async fn offer_file(self: Arc<Self>, ctx: Arc<SendContext>, date: String) {
        let name = ctx
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let offer = SiOffer {
            id: ctx.sid.clone(),
            mime_type: "application/octet-stream".into(),
            profile: ns::SI_FILE_TRANSFER.into(),
            file: FileMeta {
                name,
                size: ctx.size,
                date,
                ..Default::default()
            },
            methods: send_methods(&self.config)
                .into_iter()
                .map(|m| m.namespace().to_string())
                .collect(),
        };

        let reply = match self
            .send_iq(&ctx.peer.to_string(), "set", offer.to_element())
            .await
        {
            Ok((reply, _)) => reply,
            Err(e) => {
                self.fail_send(&ctx, TransferError::Protocol(e.to_string()));
                return;
            }
        };

        let method = match reply.await {
            Ok(Stanza::Iq(iq)) if iq.kind == IqType::Result => iq
                .payload
                .as_ref()
                .and_then(parse_chosen_method)
                .and_then(|m| Method::from_namespace(&m)),
            Ok(_) => {
                self.fail_send(&ctx, TransferError::Declined);
                return;
            }
            Err(_) => {
                self.fail_send(&ctx, TransferError::Protocol("No answer to the file transfer offer".into()));
                return;
            }
        };

        match method {
            Some(Method::Ibb) => self.ibb_send(ctx).await,
            Some(Method::Bytestreams) => self.bytestream_send(ctx).await,
            None => self.fail_send(
                &ctx,
                TransferError::Protocol("The peer chose an unknown stream method".into()),
            ),
        }
    }

    pub(crate) fn fail_send(&self, ctx: &Arc<SendContext>, error: TransferError) {
        if !self.transfers.send.remove(&ctx.sid, ctx) {
            return;
        }
        warn!(sid = %ctx.sid, error = %error, "File transfer failed");
        ctx.control.report_error(error.to_string());
    }

    pub(crate) fn finish_send(&self, ctx: &Arc<SendContext>) {
        if self.transfers.send.remove(&ctx.sid, ctx) {
            info!(sid = %ctx.sid, "File sent");
            ctx.control.report_finished();
        }
    }

    /// Stop sending if either side asked to. A local cancel sends `close`
    /// to the peer first. Returns `true` if the transfer was stopped.
    pub(crate) async fn check_send_cancelled(&self, ctx: &Arc<SendContext>, close: Option<Element>) -> bool {
        if ctx.we_want_to_cancel() {
            if let Some(close) = close {
                if let Err(e) = self.send_iq(&ctx.peer.to_string(), "set", close).await {
                    debug!(sid = %ctx.sid, error = %e, "Failed to send close");
                }
            }
            self.transfers.send.remove(&ctx.sid, ctx);
            info!(sid = %ctx.sid, "File transfer cancelled");
            return true;
        }
        if ctx.control.is_closed() {
            self.transfers.send.remove(&ctx.sid, ctx);
            info!(sid = %ctx.sid, "File transfer closed");
            return true;
        }
        if ctx.they_want_to_cancel() {
            ctx.control.close_all();
            self.transfers.send.remove(&ctx.sid, ctx);
            info!(sid = %ctx.sid, "Peer cancelled the file transfer");
            return true;
        }
        false
    }
}
