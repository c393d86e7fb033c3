use thiserror::Error;

use parley_shared::XmlError;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("stream closed")]
    StreamClosed,

    #[error("not connected")]
    NotConnected,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
