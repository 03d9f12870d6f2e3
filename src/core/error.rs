use std::collections::BTreeMap;
use thiserror::Error;

/// Per-attribute validation messages reported by a backend.
pub type ValidationErrors = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("Validation rejected: {0:?}")]
    ValidationRejected(ValidationErrors),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Record unloaded: {0}")]
    Unloaded(String),

    #[error("No async runtime: {0}")]
    NoRuntime(String),

    #[error("Store has been destroyed")]
    Destroyed,

    #[error("Lock error: {0}")]
    LockError(String),
}

impl StoreError {
    /// Errors that callers are expected to recover from by editing or retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::ValidationRejected(_)
                | StoreError::CommitFailed(_)
                | StoreError::FetchFailed(_)
        )
    }

    /// Wrap an adapter failure as a fetch error, keeping fetch errors as they are.
    pub(crate) fn into_fetch_failure(self) -> Self {
        match self {
            StoreError::FetchFailed(_) | StoreError::Unloaded(_) => self,
            other => StoreError::FetchFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
