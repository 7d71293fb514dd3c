//! Observable conversation state.
//!
//! The controller owns one [`ConversationState`] behind a mutex and hands
//! out cloned snapshots; subscribers re-render from snapshots after each
//! broadcast event.

use serde::{Deserialize, Serialize};

use folio_core::types::{Message, Role};

/// Snapshot of a conversation controller's visible state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConversationState {
    /// The one active chat, if any.
    pub active_chat_id: Option<String>,
    /// Transcript in insertion order.
    pub messages: Vec<Message>,
    /// True while a remote-backed operation is in flight.
    pub is_loading: bool,
    /// Message of the most recent failure, cleared when a new operation starts.
    pub last_error: Option<String>,
}

impl ConversationState {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The most recent message with the given role, scanning backward.
    pub fn last_of_role(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == role)
    }
}
