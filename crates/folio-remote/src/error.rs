//! Error model for remote service calls.
//!
//! Distinguishes the four outcomes the core reacts to: not-found,
//! server-reported failure, transport failure, and undecodable response.

use folio_core::error::FolioError;

/// Errors from a remote service call.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

impl From<RemoteError> for FolioError {
    fn from(err: RemoteError) -> Self {
        FolioError::Remote(err.to_string())
    }
}
