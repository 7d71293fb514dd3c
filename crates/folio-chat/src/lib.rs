//! Conversation core for Folio.
//!
//! Owns chat session state against a remote session store, isolates
//! answer-engine context per chat, and keeps a durable local transcript
//! cache. The controller is the single writer of its transcript; remote
//! failures degrade to documented optimistic local fallbacks instead of
//! dropping visible state.

pub mod cache;
pub mod controller;
pub mod error;
pub mod isolation;
pub mod state;

pub use cache::{HistoryCache, SqliteHistoryCache};
pub use controller::ConversationController;
pub use error::ChatError;
pub use isolation::ContextIsolation;
pub use state::ConversationState;
