//! Document ingestion status poller.
//!
//! Tracks an uploaded document's ingestion state and stops on the first
//! terminal status. The poller is purely advisory: it never blocks
//! question submission itself; collaborating logic consults
//! [`StatusPoller::is_ready`] as a gate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use folio_core::events::ConversationEvent;
use folio_core::types::{Document, DocumentStatus, Timestamp};
use folio_remote::DocumentService;

use crate::error::IngestError;

/// Fallback shown when the backend reports an error without a message.
pub const GENERIC_PROCESSING_ERROR: &str = "Document processing failed";

/// Default fixed polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Default)]
struct PollerState {
    status: Option<DocumentStatus>,
    error_message: Option<String>,
    /// Final record refetched once after the ready transition.
    document: Option<Document>,
}

/// Fixed-interval poller for one document's ingestion status.
///
/// Starts from the status of the already-fetched document record. While the
/// status is `processing`, each tick calls the status endpoint:
/// `ready` stops the loop after exactly one full document refetch, `error`
/// stops it with the backend's message (or a generic fallback). A poll call
/// that itself fails changes nothing and is retried on the next tick, with
/// no backoff and no retry cap.
pub struct StatusPoller {
    documents: Arc<dyn DocumentService>,
    document_id: String,
    interval: Duration,
    state: Mutex<PollerState>,
    shutdown: Arc<Notify>,
    event_tx: Option<broadcast::Sender<ConversationEvent>>,
}

impl StatusPoller {
    /// Create a poller seeded with the document record's current status.
    pub fn new(
        documents: Arc<dyn DocumentService>,
        document_id: impl Into<String>,
        initial_status: DocumentStatus,
    ) -> Self {
        Self {
            documents,
            document_id: document_id.into(),
            interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(PollerState {
                status: Some(initial_status),
                error_message: None,
                document: None,
            }),
            shutdown: Arc::new(Notify::new()),
            event_tx: None,
        }
    }

    /// Override the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Publish `DocumentStatusChanged` events on terminal transitions.
    pub fn with_events(mut self, event_tx: broadcast::Sender<ConversationEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Current ingestion status.
    pub fn status(&self) -> DocumentStatus {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.status)
            .unwrap_or(DocumentStatus::Processing)
    }

    /// Whether questions against this document can be submitted.
    pub fn is_ready(&self) -> bool {
        self.status() == DocumentStatus::Ready
    }

    /// The error message of a failed ingestion, if any.
    pub fn error_message(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.error_message.clone())
    }

    /// The terminal failure, if ingestion ended in error.
    pub fn failure(&self) -> Option<IngestError> {
        if self.status() == DocumentStatus::Error {
            Some(IngestError::ProcessingFailed(
                self.error_message()
                    .unwrap_or_else(|| GENERIC_PROCESSING_ERROR.to_string()),
            ))
        } else {
            None
        }
    }

    /// The refetched final document record, present after the ready
    /// transition (unless the refetch itself failed).
    pub fn document(&self) -> Option<Document> {
        self.state.lock().ok().and_then(|s| s.document.clone())
    }

    /// Signal the polling loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the polling loop until a terminal status or shutdown.
    ///
    /// Returns immediately when the initial status is already terminal.
    pub async fn run(&self) {
        if self.status().is_terminal() {
            debug!(
                document_id = %self.document_id,
                "Document already in terminal state, not polling"
            );
            return;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.documents.get_status(&self.document_id).await {
                        Ok(report) => match report.status {
                            DocumentStatus::Ready => {
                                self.complete().await;
                                return;
                            }
                            DocumentStatus::Error => {
                                self.fail(report.error_message);
                                return;
                            }
                            DocumentStatus::Processing => {}
                        },
                        // Transport failure: state unchanged, retried on the
                        // next tick with no backoff and no retry cap.
                        Err(e) => debug!("Status poll failed, retrying: {}", e),
                    }
                }
                _ = self.shutdown.notified() => {
                    debug!(document_id = %self.document_id, "Status poller shut down");
                    return;
                }
            }
        }
    }

    /// Transition to ready after exactly one full document refetch, so
    /// downstream consumers see final content and metadata.
    async fn complete(&self) {
        let document = match self.documents.get_document(&self.document_id).await {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!("Final document refetch failed: {}", e);
                None
            }
        };

        if let Ok(mut state) = self.state.lock() {
            state.status = Some(DocumentStatus::Ready);
            state.document = document;
        }
        info!(document_id = %self.document_id, "Document ready");
        self.emit(DocumentStatus::Ready);
    }

    fn fail(&self, error_message: Option<String>) {
        let message = error_message.unwrap_or_else(|| GENERIC_PROCESSING_ERROR.to_string());
        if let Ok(mut state) = self.state.lock() {
            state.status = Some(DocumentStatus::Error);
            state.error_message = Some(message.clone());
        }
        warn!(document_id = %self.document_id, "Document ingestion failed: {}", message);
        self.emit(DocumentStatus::Error);
    }

    fn emit(&self, status: DocumentStatus) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ConversationEvent::DocumentStatusChanged {
                document_id: self.document_id.clone(),
                status,
                timestamp: Timestamp::now(),
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
