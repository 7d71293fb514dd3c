use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default title for a chat created without a user question to derive one from.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Preview text for a session that has no messages yet.
pub const EMPTY_PREVIEW: &str = "No messages yet";

/// Maximum character length of a session preview before truncation.
pub const PREVIEW_MAX_CHARS: usize = 100;

// =============================================================================
// Enums
// =============================================================================

/// The author of a chat turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Ingestion state of an uploaded document.
///
/// `Ready` and `Error` are terminal: once reached, the status never
/// changes again and polling stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Ready | DocumentStatus::Error)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentStatus::Processing => write!(f, "processing"),
            DocumentStatus::Ready => write!(f, "ready"),
            DocumentStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(DocumentStatus::Processing),
            "ready" => Ok(DocumentStatus::Ready),
            "error" => Ok(DocumentStatus::Error),
            _ => Err(format!("Unknown document status: {}", s)),
        }
    }
}

// =============================================================================
// Newtype Wrappers
// =============================================================================

/// Unix epoch seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Message identifier distinguishing persisted entries from optimistic ones.
///
/// A `Pending` id is generated locally for a write that has not reached the
/// session store (and may never reach it). Reconciliation on a successful
/// write swaps the variant in place without changing the message's position.
/// Pending ids never cross the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    /// Assigned by the session store; opaque and stable.
    Persisted(String),
    /// Generated locally; structurally distinct from any persisted id.
    Pending(Uuid),
}

impl MessageId {
    pub fn new_pending() -> Self {
        MessageId::Pending(Uuid::new_v4())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending(_))
    }

    /// The remote id, if this message has been persisted.
    pub fn persisted(&self) -> Option<&str> {
        match self {
            MessageId::Persisted(id) => Some(id),
            MessageId::Pending(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Persisted(id) => f.write_str(id),
            MessageId::Pending(id) => write!(f, "pending-{}", id),
        }
    }
}

// =============================================================================
// Domain Structs
// =============================================================================

/// A snippet of retrieved document text attached to an assistant turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Source {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// A source carrying the conventional `"source"` label in its metadata.
    pub fn with_label(text: impl Into<String>, label: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "source".to_string(),
            serde_json::Value::String(label.into()),
        );
        Self {
            text: text.into(),
            metadata,
        }
    }

    /// The `"source"` label, when present and a string.
    pub fn label(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

/// One user question or one assistant answer within a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Owning session. Empty only for an optimistic message written before
    /// any chat could be created.
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set only when the content has been edited or regenerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Ordered; only meaningful for assistant turns.
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl Message {
    /// Build an optimistic message with a locally generated pending id.
    pub fn pending(
        chat_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        sources: Vec<Source>,
    ) -> Self {
        Self {
            id: MessageId::new_pending(),
            chat_id: chat_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            updated_at: None,
            sources,
        }
    }
}

/// A named, ordered collection of turns, optionally scoped to one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    /// Immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Derived; must equal the persisted message count.
    #[serde(default)]
    pub message_count: u64,
    /// Derived from the latest assistant turn.
    #[serde(default)]
    pub preview: String,
}

/// An uploaded document as reported by the document service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub summary: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A generated answer with its supporting sources.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<Source>,
}

// =============================================================================
// Derivation Helpers
// =============================================================================

/// Derive a chat title from the first question of a conversation.
///
/// Takes the first line, trims it, and truncates to `max_chars` characters
/// (char-boundary safe) with a `"..."` suffix. Falls back to
/// [`DEFAULT_CHAT_TITLE`] for blank input.
pub fn derive_title(content: &str, max_chars: usize) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return DEFAULT_CHAT_TITLE.to_string();
    }
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

/// Truncate message content for a session preview.
///
/// Contents longer than [`PREVIEW_MAX_CHARS`] characters keep the first 97
/// and gain a `"..."` suffix, matching the persisted-store convention.
pub fn preview_of(content: &str) -> String {
    if content.chars().count() <= PREVIEW_MAX_CHARS {
        return content.to_string();
    }
    let truncated: String = content.chars().take(PREVIEW_MAX_CHARS - 3).collect();
    format!("{}...", truncated)
}

// =============================================================================
// Tests
// =============================================================================
