//! Error types shared across the sync core.

use thiserror::Error;

use crate::sync::vector_clock::VectorClock;

/// Result type alias for sync core operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Retry policy class for sync failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
    UserActionRequired,
}

/// Phase of a sync cycle, used for timeout attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Download,
    Upload,
    FullCycle,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Download => write!(f, "download"),
            CyclePhase::Upload => write!(f, "upload"),
            CyclePhase::FullCycle => write!(f, "full cycle"),
        }
    }
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local persistence fault. The cycle aborts and the cursor stays put.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transient transport fault that survived adapter-internal retries.
    #[error("network error: {0}")]
    Network(String),

    /// Missing or rejected credentials.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Conditional write or sequence precondition failed after retries.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Remote summary state diverged from local state while unsynced local
    /// ops exist. Resolved only by an explicit Keep-Local / Keep-Remote
    /// choice.
    #[error("local data conflict: remote state is concurrent with unsynced local changes")]
    LocalDataConflict {
        local_clock: VectorClock,
        remote_clock: VectorClock,
        unsynced_count: usize,
    },

    /// Remote payload encryption state does not match the local config.
    #[error("encryption state mismatch: remote encrypted={remote_encrypted}, local config encrypted={local_encrypted}")]
    EncryptionStateMismatch {
        remote_encrypted: bool,
        local_encrypted: bool,
    },

    /// Remote op carries a payload shape this build cannot interpret.
    #[error("schema version mismatch: found {found}, supported {supported}")]
    SchemaVersionMismatch { found: u32, supported: u32 },

    /// Envelope could not be sealed or opened.
    #[error("envelope error: {0}")]
    Envelope(String),

    /// A phase exceeded its deadline.
    #[error("{phase} timed out")]
    Timeout { phase: CyclePhase },

    /// The cycle observed the cancellation flag at a checkpoint.
    #[error("sync cancelled")]
    Cancelled,

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SyncError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn envelope(message: impl Into<String>) -> Self {
        Self::Envelope(message.into())
    }

    /// Classify the error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Storage(_) => RetryClass::Retryable,
            Self::Network(_) => RetryClass::Retryable,
            Self::Auth(_) => RetryClass::ReauthRequired,
            Self::Precondition(_) => RetryClass::Retryable,
            Self::LocalDataConflict { .. } => RetryClass::UserActionRequired,
            Self::EncryptionStateMismatch { .. } => RetryClass::UserActionRequired,
            Self::SchemaVersionMismatch { .. } => RetryClass::UserActionRequired,
            Self::Envelope(_) => RetryClass::Permanent,
            Self::Timeout { .. } => RetryClass::Retryable,
            Self::Cancelled => RetryClass::Permanent,
            Self::Serde(_) => RetryClass::Permanent,
        }
    }

    /// True when the error must be surfaced to the user instead of retried.
    pub fn is_user_actionable(&self) -> bool {
        matches!(self.retry_class(), RetryClass::UserActionRequired)
            || matches!(self.retry_class(), RetryClass::ReauthRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_requires_user_action() {
        let err = SyncError::LocalDataConflict {
            local_clock: VectorClock::default(),
            remote_clock: VectorClock::default(),
            unsynced_count: 2,
        };
        assert_eq!(err.retry_class(), RetryClass::UserActionRequired);
        assert!(err.is_user_actionable());
    }

    #[test]
    fn network_errors_are_retryable() {
        assert_eq!(
            SyncError::network("connection reset").retry_class(),
            RetryClass::Retryable
        );
    }
}
