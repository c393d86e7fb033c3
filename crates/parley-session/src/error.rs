use std::path::PathBuf;

use thiserror::Error;

use parley_net::NetError;
use parley_shared::{Jid, JidError};

use crate::conversation::ConversationError;
use crate::session::ConnStatus;

/// Errors returned by session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Invalid address: {0}")]
    Jid(#[from] JidError),

    #[error("Operation not allowed while {0:?}")]
    InvalidState(ConnStatus),

    #[error("Not connected")]
    NotConnected,

    #[error("No conversation with {0}")]
    NoConversation(Jid),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),

    #[error("File transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single file transfer. They are reported through the
/// transfer's control handle and never end the session.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No mutually acceptable file transfer methods available")]
    NoAcceptableMethod,

    #[error("The peer declined the file transfer")]
    Declined,

    #[error("Unexpected data packet sequence")]
    UnexpectedSequence,

    #[error("Couldn't open local temporary file")]
    TempFile,

    #[error("Couldn't save final file")]
    SaveFinal,

    #[error("Incorrect final size of file - this implies the transfer was cancelled")]
    IncorrectSize,

    #[error("Not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("{0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;
