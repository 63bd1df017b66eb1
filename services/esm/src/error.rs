//! Error types for the ESM daemon.

use esm_catalog::CatalogError;
use thiserror::Error;

/// Daemon errors, tagged by kind so callers can branch on what happened
/// rather than on concrete types.
#[derive(Debug, Error)]
pub enum EsmError {
    /// Another live instance already holds this identity. Fatal at
    /// startup.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A catalog call failed in a way that should be retried, not
    /// surfaced.
    #[error("transient catalog error: {0}")]
    Transient(#[source] CatalogError),

    /// The catalog dropped our session; all held checks and locks are
    /// gone.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// The catalog or a peer runs a version below the supported minimum.
    #[error("incompatible version: {0}")]
    Incompatible(String),

    /// Unrecoverable failure; propagates to the process entry point.
    #[error("{0}")]
    Fatal(String),
}

/// Discriminant for [`EsmError`], for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyExists,
    Transient,
    SessionLost,
    Incompatible,
    Fatal,
}

impl EsmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EsmError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EsmError::Transient(_) => ErrorKind::Transient,
            EsmError::SessionLost(_) => ErrorKind::SessionLost,
            EsmError::Incompatible(_) => ErrorKind::Incompatible,
            EsmError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<CatalogError> for EsmError {
    fn from(err: CatalogError) -> Self {
        if err.is_transient() {
            EsmError::Transient(err)
        } else {
            EsmError::Fatal(err.to_string())
        }
    }
}

/// Result alias used throughout the daemon.
pub type Result<T> = std::result::Result<T, EsmError>;
