//! Document ingestion tracking for Folio.
//!
//! Provides the advisory status poller that follows an uploaded
//! document from `processing` to a terminal `ready` or `error` state
//! and gates question submission for collaborating logic.

pub mod error;
pub mod poller;

pub use error::IngestError;
pub use poller::{StatusPoller, DEFAULT_POLL_INTERVAL, GENERIC_PROCESSING_ERROR};
