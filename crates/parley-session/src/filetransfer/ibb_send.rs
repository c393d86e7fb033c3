use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::fs::File;
use tokio::sync::oneshot;
use tracing::{debug, info};

use parley_shared::constants::IBB_BURST;
use parley_shared::filetransfer::{IbbClose, IbbData, IbbOpen};
use parley_shared::{ClientIq, IqType, Stanza};

use super::send::SendContext;
use super::wrap::WrappedReader;
use crate::error::TransferError;
use crate::session::Session;

fn is_resource_constraint(iq: &ClientIq) -> bool {
    iq.kind == IqType::Error
        && iq
            .error
            .as_ref()
            .is_some_and(|e| e.kind == "modify" && e.condition == "resource-constraint")
}

/// Watch the acknowledgement of one data unit. Anything but a result means
/// the receiver wants the transfer stopped; silence is not an error.
async fn track_result(ctx: Arc<SendContext>, reply: oneshot::Receiver<Stanza>, ack_timeout: Duration) {
    if let Ok(Ok(Stanza::Iq(iq))) = tokio::time::timeout(ack_timeout, reply).await {
        if iq.kind != IqType::Result {
            info!(sid = %ctx.sid, "Receiver rejected in-band data");
            ctx.set_they_want_to_cancel();
        }
    }
}

impl Session {
    /// Open the in-band stream, halving the block size while the receiver
    /// answers `resource-constraint`. Returns the block size agreed on.
    async fn ibb_open_stream(&self, ctx: &Arc<SendContext>) -> Result<usize, TransferError> {
        let mut block_size = self.config.ibb_block_size;
        loop {
            if block_size == 0 {
                return Err(TransferError::Protocol(
                    "Couldn't agree on an in-band block size".into(),
                ));
            }
            let open = IbbOpen {
                sid: ctx.sid.clone(),
                block_size,
                stanza: "iq".into(),
            };
            let (reply, _) = self
                .send_iq(&ctx.peer.to_string(), "set", open.to_element())
                .await
                .map_err(|e| TransferError::Protocol(e.to_string()))?;

            match reply.await {
                Ok(Stanza::Iq(iq)) if iq.kind == IqType::Result => return Ok(block_size),
                Ok(Stanza::Iq(iq)) if is_resource_constraint(&iq) => {
                    debug!(sid = %ctx.sid, block_size, "Receiver wants smaller blocks");
                    block_size /= 2;
                }
                Ok(_) => return Err(TransferError::Declined),
                Err(_) => {
                    return Err(TransferError::Protocol(
                        "No answer to the in-band stream open".into(),
                    ))
                }
            }
        }
    }

    /// Send the file as base64 data units, `IBB_BURST` per tick. Each unit
    /// is a block of the wrapped file; acknowledgements may take up to
    /// `ibb_ack_timeout`.
    pub(crate) async fn ibb_send(self: Arc<Self>, ctx: Arc<SendContext>) {
        let block_size = match self.ibb_open_stream(&ctx).await {
            Ok(size) => size,
            Err(e) => {
                self.fail_send(&ctx, e);
                return;
            }
        };
        let file = match File::open(&ctx.path).await {
            Ok(file) => file,
            Err(e) => {
                self.fail_send(&ctx, TransferError::Io(e));
                return;
            }
        };
        let mut reader = WrappedReader::new(file, ctx.take_wrapper(), block_size);

        let peer = ctx.peer.to_string();
        let close = IbbClose {
            sid: ctx.sid.clone(),
        };
        let mut seq: u16 = 0;

        loop {
            for _ in 0..IBB_BURST {
                if self.check_send_cancelled(&ctx, Some(close.to_element())).await {
                    return;
                }

                let block = match reader.next_block(block_size).await {
                    Ok(block) => block,
                    Err(e) => {
                        self.fail_send(&ctx, TransferError::Io(e));
                        return;
                    }
                };

                if let Some(block) = block {
                    let data = IbbData {
                        sid: ctx.sid.clone(),
                        seq,
                        data: STANDARD.encode(&block),
                    };
                    let ack_timeout = self.config.ibb_ack_timeout;
                    match self
                        .send_iq_with_deadline(&peer, "set", data.to_element(), ack_timeout)
                        .await
                    {
                        Ok((reply, _)) => {
                            tokio::spawn(track_result(ctx.clone(), reply, ack_timeout));
                        }
                        Err(e) => {
                            self.fail_send(&ctx, TransferError::Protocol(e.to_string()));
                            return;
                        }
                    }
                    seq = seq.wrapping_add(1);
                    ctx.control.report_progress(reader.consumed());
                }

                if reader.is_exhausted() {
                    if let Err(e) = self.send_iq(&peer, "set", close.to_element()).await {
                        debug!(sid = %ctx.sid, error = %e, "Failed to close in-band stream");
                    }
                    self.finish_send(&ctx);
                    return;
                }
            }
            tokio::time::sleep(self.config.ibb_send_interval).await;
        }
    }
}
