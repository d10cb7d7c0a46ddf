use crate::job::JobId;
use thiserror::Error;

/// Errors returned synchronously by the stores
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{idx} already exists")]
    AlreadyExists { idx: String },

    #[error("{path}: record not found")]
    RecordNotFound { path: String },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {0} is already running")]
    JobAlreadyRunning(JobId),

    #[error("job depends on unknown job {0}")]
    UnknownDependency(JobId),
}

impl StoreError {
    pub fn record_not_found(path: impl Into<String>) -> Self {
        StoreError::RecordNotFound { path: path.into() }
    }

    pub fn already_exists(idx: impl Into<String>) -> Self {
        StoreError::AlreadyExists { idx: idx.into() }
    }

    pub fn is_record_not_found(&self) -> bool {
        matches!(self, StoreError::RecordNotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
