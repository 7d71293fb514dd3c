//! Remote service contracts and adapters for the Folio conversation core.
//!
//! Defines the session store, answer engine, and document service as
//! opaque asynchronous contracts, with HTTP adapters speaking the
//! backend's JSON routes and in-memory adapters for tests and tooling.

pub mod contract;
pub mod error;
pub mod http;
pub mod memory;

pub use contract::{AnswerEngine, ChatWithMessages, DocumentService, SessionStore, StatusReport};
pub use error::RemoteError;
pub use http::{HttpAnswerEngine, HttpDocumentService, HttpSessionStore};
pub use memory::{CannedAnswerEngine, MemoryDocumentService, MemorySessionStore};
