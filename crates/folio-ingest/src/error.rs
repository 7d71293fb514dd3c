//! Error types for document ingestion tracking.

use folio_core::error::FolioError;

/// Errors from the ingestion status machine.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Document processing failed: {0}")]
    ProcessingFailed(String),
}

impl From<IngestError> for FolioError {
    fn from(err: IngestError) -> Self {
        FolioError::Ingestion(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_display() {
        let err = IngestError::ProcessingFailed("index upload failed".to_string());
        assert_eq!(
            err.to_string(),
            "Document processing failed: index upload failed"
        );
    }

    #[test]
    fn test_ingest_error_into_folio_error() {
        let err: FolioError = IngestError::ProcessingFailed("boom".to_string()).into();
        assert!(matches!(err, FolioError::Ingestion(_)));
        assert!(err.to_string().contains("boom"));
    }
}
