use serde::{Deserialize, Serialize};

use crate::types::{DocumentStatus, MessageId, Role, Timestamp};

/// All domain events emitted by the conversation core.
///
/// Events are published by the controller and poller after state changes
/// and consumed over a `tokio::sync::broadcast` channel by subscribers
/// (UI re-render, audit logging). Send failures with no subscribers are
/// ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConversationEvent {
    /// A chat session was created (lazily or explicitly).
    ChatCreated {
        chat_id: String,
        timestamp: Timestamp,
    },

    /// The active chat changed from one id to another.
    ChatSwitched {
        from: Option<String>,
        to: String,
        timestamp: Timestamp,
    },

    /// A chat session was deleted remotely.
    ChatDeleted {
        chat_id: String,
        timestamp: Timestamp,
    },

    /// A chat and its messages were loaded, replacing local state wholesale.
    ConversationLoaded {
        chat_id: String,
        message_count: usize,
        timestamp: Timestamp,
    },

    /// A message was appended to the transcript.
    MessageAppended {
        chat_id: String,
        message_id: MessageId,
        role: Role,
        /// True when the append is an optimistic fallback after a failed write.
        pending: bool,
        timestamp: Timestamp,
    },

    /// A user message was edited in place.
    MessageEdited {
        chat_id: String,
        message_id: MessageId,
        timestamp: Timestamp,
    },

    /// The most recent assistant message was regenerated in place.
    AnswerRegenerated {
        chat_id: String,
        message_id: MessageId,
        timestamp: Timestamp,
    },

    /// All messages of the active chat were cleared.
    ConversationCleared {
        chat_id: String,
        timestamp: Timestamp,
    },

    /// A context reset was issued to the answer engine.
    ContextResetIssued { timestamp: Timestamp },

    /// A document's ingestion status changed.
    DocumentStatusChanged {
        document_id: String,
        status: DocumentStatus,
        timestamp: Timestamp,
    },
}

impl ConversationEvent {
    /// Returns the timestamp of the event.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            ConversationEvent::ChatCreated { timestamp, .. }
            | ConversationEvent::ChatSwitched { timestamp, .. }
            | ConversationEvent::ChatDeleted { timestamp, .. }
            | ConversationEvent::ConversationLoaded { timestamp, .. }
            | ConversationEvent::MessageAppended { timestamp, .. }
            | ConversationEvent::MessageEdited { timestamp, .. }
            | ConversationEvent::AnswerRegenerated { timestamp, .. }
            | ConversationEvent::ConversationCleared { timestamp, .. }
            | ConversationEvent::ContextResetIssued { timestamp }
            | ConversationEvent::DocumentStatusChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Returns a human-readable event name for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            ConversationEvent::ChatCreated { .. } => "chat_created",
            ConversationEvent::ChatSwitched { .. } => "chat_switched",
            ConversationEvent::ChatDeleted { .. } => "chat_deleted",
            ConversationEvent::ConversationLoaded { .. } => "conversation_loaded",
            ConversationEvent::MessageAppended { .. } => "message_appended",
            ConversationEvent::MessageEdited { .. } => "message_edited",
            ConversationEvent::AnswerRegenerated { .. } => "answer_regenerated",
            ConversationEvent::ConversationCleared { .. } => "conversation_cleared",
            ConversationEvent::ContextResetIssued { .. } => "context_reset_issued",
            ConversationEvent::DocumentStatusChanged { .. } => "document_status_changed",
        }
    }
}
