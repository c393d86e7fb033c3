//! File transfer engine.
//!
//! Offers are negotiated with stream initiation (XEP-0095/0096). The payload
//! then travels over one of the stream methods in [`Method`]: SOCKS5
//! bytestreams, or in-band bytestreams as the fallback every peer supports.
//! Transfers in progress live in two in-flight tables, one per direction,
//! and every teardown path removes its entry exactly once.

mod bytestreams;
mod control;
mod ibb_recv;
mod ibb_send;
mod inflight;
mod recv;
mod registry;
mod send;
mod wrap;

use sha1::{Digest, Sha1};

pub use control::{FileTransferControl, TransferUpdate};
pub use registry::Method;
pub use wrap::{PassThrough, SendWrapper};

use inflight::InflightTable;
use recv::RecvContext;
use send::SendContext;

use crate::session::Session;

#[derive(Default)]
pub(crate) struct Transfers {
    pub(crate) recv: InflightTable<RecvContext>,
    pub(crate) send: InflightTable<SendContext>,
}

/// SOCKS5 destination address of a bytestream (XEP-0065 section 5.3.2).
fn socks5_destination(sid: &str, initiator: &str, target: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.as_bytes());
    hasher.update(target.as_bytes());
    hex::encode(hasher.finalize())
}

impl Session {
    /// Number of transfers currently in flight, both directions.
    pub fn active_transfers(&self) -> usize {
        self.transfers.recv.len() + self.transfers.send.len()
    }
}
