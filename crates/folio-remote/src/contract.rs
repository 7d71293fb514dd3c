//! Contracts for the three collaborator-owned remote services.
//!
//! The conversation core consumes these as opaque asynchronous services:
//! it specifies only call shape and the client-side reaction to
//! success / not-found / server-error / network-error outcomes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use folio_core::types::{Answer, ChatSession, Document, DocumentStatus, Message, Role, Source};

use crate::error::RemoteError;

/// A chat together with its full ordered message history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatWithMessages {
    pub chat: ChatSession,
    pub messages: Vec<Message>,
}

/// A document's ingestion status as reported by the status endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: DocumentStatus,
    /// Present only when `status` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Remote CRUD on chats and their messages.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_chat(
        &self,
        title: &str,
        document_id: Option<&str>,
    ) -> Result<ChatSession, RemoteError>;

    async fn get_chats(&self, document_id: Option<&str>) -> Result<Vec<ChatSession>, RemoteError>;

    async fn get_chat(&self, chat_id: &str) -> Result<ChatWithMessages, RemoteError>;

    async fn update_chat(&self, chat_id: &str, title: &str) -> Result<ChatSession, RemoteError>;

    async fn delete_chat(&self, chat_id: &str) -> Result<(), RemoteError>;

    async fn add_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        sources: &[Source],
    ) -> Result<Message, RemoteError>;

    async fn update_message(
        &self,
        chat_id: &str,
        message_id: &str,
        content: &str,
        sources: Option<&[Source]>,
    ) -> Result<Message, RemoteError>;

    async fn clear_messages(&self, chat_id: &str) -> Result<(), RemoteError>;
}

/// The retrieval-augmented answering service.
///
/// The engine maintains its own server-side conversational memory,
/// implicitly scoped to "the current conversation"; `clear_memory`
/// instructs it to forget that context.
#[async_trait]
pub trait AnswerEngine: Send + Sync {
    async fn ask(
        &self,
        question: &str,
        chat_id: Option<&str>,
        regeneration: bool,
    ) -> Result<Answer, RemoteError>;

    async fn ask_document(
        &self,
        document_id: &str,
        question: &str,
        chat_id: Option<&str>,
        regeneration: bool,
    ) -> Result<Answer, RemoteError>;

    async fn clear_memory(&self) -> Result<(), RemoteError>;
}

/// Document record and ingestion-status lookups.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn get_document(&self, document_id: &str) -> Result<Document, RemoteError>;

    async fn get_status(&self, document_id: &str) -> Result<StatusReport, RemoteError>;
}
