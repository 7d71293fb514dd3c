//! Answer-engine context isolation.
//!
//! The QA engine holds server-side conversational memory implicitly scoped
//! to "the current conversation". Because multiple chats exist, the engine
//! must be told to forget prior context whenever the active chat changes
//! to a different chat, or when a chat is cleared or deleted.

use std::sync::Arc;

use tracing::{debug, warn};

use folio_remote::AnswerEngine;

/// Issues context-reset calls to the answer engine.
///
/// Resets are best-effort: a failure is logged and swallowed, and never
/// blocks the chat switch, clear, or delete that triggered it.
pub struct ContextIsolation {
    engine: Arc<dyn AnswerEngine>,
}

impl ContextIsolation {
    pub fn new(engine: Arc<dyn AnswerEngine>) -> Self {
        Self { engine }
    }

    /// Instruct the engine to discard its conversational memory.
    ///
    /// Idempotent. Failure is logged at warn level and never propagated.
    pub async fn reset_context(&self) {
        match self.engine.clear_memory().await {
            Ok(()) => debug!("Answer engine context reset"),
            Err(e) => warn!("Context reset failed (ignored): {}", e),
        }
    }
}
