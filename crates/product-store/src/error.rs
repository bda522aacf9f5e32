//! Error types for the product store.

use thiserror::Error;

use clim_common::PipelineError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while writing, merging or publishing store keys.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Zarr format or codec error.
    #[error("Zarr error: {0}")]
    Zarr(String),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object storage error.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// The store index could not be read or written.
    #[error("store index error: {0}")]
    Index(String),

    /// Two outputs in one batch claim the same key.
    #[error("conflicting outputs: {0}")]
    Conflict(String),

    /// Invalid store or publication settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn zarr(msg: impl ToString) -> Self {
        Self::Zarr(msg.to_string())
    }

    pub fn object_store(msg: impl ToString) -> Self {
        Self::ObjectStore(msg.to_string())
    }

    /// Convert into the pipeline taxonomy, scoped to one store key.
    pub fn into_pipeline(self, key: &str) -> PipelineError {
        match self {
            StoreError::Conflict(reason) => PipelineError::StoreWriteConflict {
                key: key.to_string(),
                reason,
            },
            StoreError::Config(reason) => PipelineError::Config(reason),
            other => PipelineError::StoreWriteFailure {
                key: key.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<walkdir::Error> for StoreError {
    fn from(err: walkdir::Error) -> Self {
        StoreError::Io(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Index(err.to_string())
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        StoreError::ObjectStore(err.to_string())
    }
}
