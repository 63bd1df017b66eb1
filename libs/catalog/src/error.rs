//! Error types for catalog API calls.

use thiserror::Error;

/// Errors returned by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog answered with a non-success HTTP status.
    #[error("catalog returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never completed (connect failure, timeout, reset).
    #[error("catalog transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body could not be decoded.
    #[error("invalid catalog response: {0}")]
    Decode(String),

    /// A request could not be built from the given inputs.
    #[error("invalid request: {0}")]
    InvalidInput(String),
}

impl CatalogError {
    /// True when the call may succeed if retried (network trouble or a
    /// server-side 5xx), as opposed to a definitive API answer.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Transport(_) => true,
            CatalogError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True when the catalog answered 404 for the requested resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::Status { status: 404, .. })
    }
}
