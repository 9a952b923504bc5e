//! Generic file-store surface consumed by the file-based adapter.
//!
//! Implementations exist for the local filesystem, WebDAV and process
//! memory; Dropbox and SAF back-ends plug in through the same trait.

use async_trait::async_trait;
use daystack_core::errors::SyncError;
use thiserror::Error;

/// A downloaded file with its conditional-write revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// `ETag` when the store exposes one, else a `Last-Modified`-derived
    /// string. Empty when the store supports neither.
    pub rev: String,
    pub data: Vec<u8>,
}

/// Errors raised by file-store providers.
#[derive(Debug, Error)]
pub enum FileProviderError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("revision mismatch: expected {expected:?}, found {actual:?}")]
    RevMismatch {
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider error: {0}")]
    Other(String),
}

impl FileProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn is_rev_mismatch(&self) -> bool {
        matches!(self, Self::RevMismatch { .. })
    }
}

impl From<FileProviderError> for SyncError {
    fn from(err: FileProviderError) -> Self {
        match &err {
            FileProviderError::Auth(message) => SyncError::auth(message.clone()),
            FileProviderError::RevMismatch { .. } => SyncError::precondition(err.to_string()),
            _ => SyncError::network(err.to_string()),
        }
    }
}

/// Generic file store: upload, download, list, remove.
///
/// Conditional-write semantics for `upload_file`:
/// - `expected_rev: Some(rev)` replaces only if the remote revision still
///   matches, else `RevMismatch`.
/// - `expected_rev: None` with `force_overwrite: false` creates only; an
///   existing file is a `RevMismatch`.
/// - `force_overwrite: true` writes unconditionally.
#[async_trait]
pub trait FileStoreProvider: Send + Sync {
    /// Provider configured well enough to attempt a transfer.
    async fn is_ready(&self) -> bool;

    /// False for stores that cannot enforce write preconditions; the
    /// adapter then falls back to the in-file `syncVersion`.
    fn supports_conditional_writes(&self) -> bool {
        true
    }

    async fn download_file(&self, path: &str) -> Result<RemoteFile, FileProviderError>;

    async fn upload_file(
        &self,
        path: &str,
        data: &[u8],
        expected_rev: Option<&str>,
        force_overwrite: bool,
    ) -> Result<String, FileProviderError>;

    async fn remove(&self, path: &str, expected_rev: Option<&str>)
        -> Result<(), FileProviderError>;

    async fn list_files(&self, path: &str) -> Result<Vec<String>, FileProviderError>;

    /// Create a directory (and parents). Succeeds if it already exists.
    async fn create_dir(&self, path: &str) -> Result<(), FileProviderError>;
}
