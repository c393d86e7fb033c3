use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Address error: {0}")]
    Jid(#[from] JidError),

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JidError {
    #[error("empty address")]
    Empty,

    #[error("address has no domain: {0}")]
    MissingDomain(String),

    #[error("address has an empty local part or resource: {0}")]
    EmptyPart(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XmlError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("closing tag without a matching opening tag")]
    UnexpectedEnd,

    #[error("document ended before the element was complete")]
    Incomplete,

    #[error("invalid UTF-8 in element content")]
    InvalidUtf8,

    #[error("unknown namespace prefix: {0}")]
    UnknownPrefix(String),

    #[error("bad escape sequence: {0}")]
    Escape(String),
}
