use async_trait::async_trait;
use thiserror::Error;

use crate::formatter::MessageFormat;

/// Why a send failed, decided once where the transport error is observed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Network trouble, rate limiting, server-side errors. Worth retrying.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// The chat service could not parse the markup in the message.
    #[error("markup rejected: {0}")]
    MarkupRejected(String),

    /// Anything retrying will not fix (blocked bot, unknown chat, ...).
    #[error("send failed: {0}")]
    Permanent(String),
}

/// Outbound side of a chat service.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one message of at most the service's size limit.
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        format: MessageFormat,
    ) -> Result<(), SendError>;

    /// Show a "typing" indicator in the chat.
    async fn send_typing(&self, chat_id: i64) -> Result<(), SendError>;
}
