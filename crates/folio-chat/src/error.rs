//! Error types for the conversation controller.

use folio_core::error::FolioError;

/// Errors from conversation operations.
///
/// Remote failures are reported through these variants only after the
/// operation's documented local fallback has been applied; precondition
/// failures abort before any remote call.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("failed to load conversation: {0}")]
    RemoteFetch(String),
    #[error("failed to persist change: {0}")]
    RemoteWrite(String),
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("no assistant message to regenerate")]
    NoAssistantMessage,
    #[error("history cache error: {0}")]
    Cache(String),
}

impl From<ChatError> for FolioError {
    fn from(err: ChatError) -> Self {
        FolioError::Conversation(err.to_string())
    }
}
