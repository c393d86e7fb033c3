//! Seam to the end-to-end encryption layer.
//!
//! The session never looks inside a conversation; it feeds inbound bodies
//! through [`Conversation::receive`] and only branches on
//! [`Conversation::is_encrypted`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use parley_shared::Jid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConversationError(pub String);

#[async_trait]
pub trait Conversation: Send + Sync {
    /// Decode an inbound body. An empty result means the message was
    /// protocol traffic with nothing to show.
    fn receive(&self, message: &[u8]) -> Result<Vec<u8>, ConversationError>;

    fn is_encrypted(&self) -> bool;

    /// Send a message to the peer; returns an opaque trace id.
    async fn send(&self, message: &[u8]) -> Result<u64, ConversationError>;

    async fn start_encrypted_chat(&self) -> Result<(), ConversationError>;

    async fn end_encrypted_chat(&self) -> Result<(), ConversationError>;

    async fn start_smp(&self, question: &str, answer: &str) -> Result<(), ConversationError>;

    async fn finish_smp(&self, answer: &str) -> Result<(), ConversationError>;

    async fn abort_smp(&self) -> Result<(), ConversationError>;
}

pub trait ConversationManager: Send + Sync {
    /// The conversation with `peer`, created if needed. The flag tells
    /// whether it was just created.
    fn ensure_conversation_with(&self, peer: &Jid) -> (Arc<dyn Conversation>, bool);

    fn get_conversation_with(&self, peer: &Jid) -> Option<Arc<dyn Conversation>>;
}
