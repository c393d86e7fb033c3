use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use parley_shared::filetransfer::{IbbClose, IbbData, IbbOpen};
use parley_shared::{ClientIq, StanzaError};

use super::registry::Method;
use crate::error::TransferError;
use crate::session::Session;

impl Session {
    /// `open`, `data` and `close` of an in-band bytestream. A `close` may
    /// also come from the receiver of a file we are sending.
    pub(crate) async fn receive_ibb(self: &Arc<Self>, iq: ClientIq) {
        let Some(payload) = iq.payload.as_ref() else {
            return;
        };

        if let Some(open) = IbbOpen::from_element(payload) {
            self.ibb_open(&iq, open).await;
        } else if let Some(data) = IbbData::from_element(payload) {
            self.ibb_data(&iq, data).await;
        } else if let Some(close) = IbbClose::from_element(payload) {
            self.ibb_close(&iq, close).await;
        } else {
            self.info(format!("Unknown IQ: {}", iq.raw.to_xml()));
        }
    }

    async fn ibb_open(&self, iq: &ClientIq, open: IbbOpen) {
        let ctx = self
            .recv_context(&open.sid, &iq.from)
            .filter(|ctx| ctx.method() == Some(Method::Ibb));
        let Some(ctx) = ctx else {
            self.reply_error(iq, StanzaError::item_not_found()).await;
            return;
        };
        if open.block_size == 0 {
            self.reply_error(iq, StanzaError::bad_request()).await;
            return;
        }
        debug!(sid = %ctx.sid, block_size = open.block_size, "In-band bytestream opened");
        self.reply_result(iq, None).await;
    }

    async fn ibb_data(&self, iq: &ClientIq, data: IbbData) {
        let Some(ctx) = self.recv_context(&data.sid, &iq.from) else {
            self.reply_error(iq, StanzaError::item_not_found()).await;
            return;
        };

        let outcome = {
            let mut guard = ctx.state.lock().await;
            let Some(state) = guard.as_mut() else {
                drop(guard);
                self.reply_error(iq, StanzaError::item_not_found()).await;
                return;
            };
            if data.seq != state.next_seq {
                Err((TransferError::UnexpectedSequence, StanzaError::unexpected_request()))
            } else {
                match STANDARD.decode(data.data.as_bytes()) {
                    Err(e) => Err((
                        TransferError::Protocol(format!("Invalid in-band data: {}", e)),
                        StanzaError::bad_request(),
                    )),
                    Ok(bytes) => match state.write(&bytes).await {
                        Ok(received) => {
                            state.next_seq = state.next_seq.wrapping_add(1);
                            Ok(received)
                        }
                        Err(e) => Err((TransferError::Io(e), StanzaError::new("cancel", "internal-server-error"))),
                    },
                }
            }
        };

        match outcome {
            Ok(received) => {
                ctx.control.report_progress(received);
                self.reply_result(iq, None).await;
            }
            Err((error, reply)) => {
                self.fail_receive(&ctx, error).await;
                self.reply_error(iq, reply).await;
            }
        }
    }

    async fn ibb_close(&self, iq: &ClientIq, close: IbbClose) {
        if let Some(ctx) = self.recv_context(&close.sid, &iq.from) {
            self.reply_result(iq, None).await;
            self.finish_receive(&ctx).await;
            return;
        }

        let sending = self
            .transfers
            .send
            .get(&close.sid)
            .filter(|ctx| ctx.is_to(&iq.from));
        match sending {
            Some(ctx) => {
                debug!(sid = %ctx.sid, "Receiver closed the in-band bytestream");
                ctx.set_they_want_to_cancel();
                self.reply_result(iq, None).await;
            }
            None => self.reply_error(iq, StanzaError::item_not_found()).await,
        }
    }
}
