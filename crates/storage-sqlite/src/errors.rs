//! Storage error types and their mapping into the core taxonomy.

use daystack_core::errors::SyncError;
use thiserror::Error;

/// Errors raised by the SQLite layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage invariant violated: {0}")]
    Invariant(String),
}

impl StorageError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::storage(err.to_string())
    }
}
