// Session core of the Parley XMPP client: connection state machine, stanza
// dispatch, roster upkeep, the per-session event bus and the file transfer
// engine.

pub mod config;
pub mod connection;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod filetransfer;
pub mod rooms;
pub mod session;

#[cfg(test)]
mod test_support;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::{Account, SessionConfig};
pub use conversation::{Conversation, ConversationError, ConversationManager};
pub use error::{Result, SessionError, TransferError};
pub use events::{
    ConnectionEvent, Event, EventBus, FileTransferAnswer, FileTransferRequest, LogLevel,
    PeerEventKind, SubscriptionId,
};
pub use filetransfer::{FileTransferControl, PassThrough, SendWrapper, TransferUpdate};
pub use rooms::{Occupant, Rooms};
pub use session::{ConnStatus, Session};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley_session=debug,parley_net=debug,parley_roster=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
