//! Op log store contract: durable, ordered storage of operations and
//! ancillary sync state (cursors, client id, engine status).

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::sync::op::SyncOp;
use crate::sync::vector_clock::VectorClock;

/// Synced ops older than this are eligible for compaction.
pub const RETENTION_DAYS: i64 = 45;

/// Cap on recent ops kept for piggyback and in the shared-file container.
pub const RECENT_OPS_CAP: usize = 500;

/// Adapter family a cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    ServerSeq,
    File,
}

/// Adapter-specific marker of the last successfully applied remote position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all_fields = "camelCase")]
pub enum SyncCursor {
    /// Monotone sequence number handed out by the op-sync server.
    #[serde(rename = "serverSeq")]
    ServerSeq { last_server_seq: i64 },
    /// Logical counter inside the shared file plus the conditional-write
    /// revision captured at download time.
    #[serde(rename = "file")]
    File {
        last_sync_version: u64,
        last_mod_rev: Option<String>,
    },
}

impl SyncCursor {
    pub fn initial(kind: CursorKind) -> Self {
        match kind {
            CursorKind::ServerSeq => SyncCursor::ServerSeq { last_server_seq: 0 },
            CursorKind::File => SyncCursor::File {
                last_sync_version: 0,
                last_mod_rev: None,
            },
        }
    }

    pub fn kind(&self) -> CursorKind {
        match self {
            SyncCursor::ServerSeq { .. } => CursorKind::ServerSeq,
            SyncCursor::File { .. } => CursorKind::File,
        }
    }
}

/// An op at rest in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOp {
    pub op: SyncOp,
    /// Local insertion order, monotone per install.
    pub local_seq: i64,
    pub is_synced: bool,
    /// True when the op arrived from a remote and was applied here.
    pub applied_remote: bool,
}

/// Persisted engine status surfaced to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub next_retry_at: Option<String>,
    pub last_cycle_status: Option<String>,
    pub last_cycle_duration_ms: Option<i64>,
}

/// One cycle's outcome, persisted into the engine status row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRecord {
    pub status: String,
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub duration_ms: i64,
    pub next_retry_at: Option<String>,
}

/// Durable, ordered storage of operations.
///
/// All methods are atomic at the op-batch level: a batch append or a
/// mark-synced either lands completely or not at all. Storage faults are
/// surfaced as `SyncError::Storage`; callers must not advance cursors on
/// failure.
pub trait OpLogStore: Send + Sync {
    /// Persist one op. Re-appending an already present `id` is a no-op.
    fn append(&self, op: &SyncOp) -> Result<()>;

    /// Persist several ops, all or none.
    fn append_batch(&self, ops: &[SyncOp]) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<StoredOp>>;

    /// Unsynced ops in insertion order.
    fn get_unsynced(&self) -> Result<Vec<SyncOp>>;

    /// The most recent `n` ops (any sync state), insertion order.
    fn get_recent(&self, n: usize) -> Result<Vec<SyncOp>>;

    /// Flip `is_synced` for all given ids, atomically.
    fn mark_synced(&self, ids: &[String]) -> Result<()>;

    /// Download-side de-duplication check.
    fn has_applied(&self, id: &str) -> Result<bool>;

    /// Record remote ops as applied (and absorb their clocks into the
    /// observed clock). Ops not yet in the log are appended as synced.
    fn record_applied(&self, ops: &[SyncOp]) -> Result<()>;

    /// Drop unsynced ops (Keep-Remote conflict resolution). Returns the
    /// dropped ids.
    fn discard_unsynced(&self) -> Result<Vec<String>>;

    /// Remove synced ops older than `retention_ms`, preserving the newest
    /// `RECENT_OPS_CAP` synced ops for piggyback. Returns how many were
    /// dropped.
    fn compact(&self, retention_ms: i64) -> Result<usize>;

    fn get_cursor(&self, kind: CursorKind) -> Result<SyncCursor>;

    fn set_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    /// Stable per-install identifier; `None` until first assigned.
    fn get_client_id(&self) -> Result<Option<String>>;

    /// Assign (or, on clean slate, replace) the client id.
    fn set_client_id(&self, id: &str) -> Result<()>;

    /// Merged clock over every op produced or observed by this install.
    fn observed_clock(&self) -> Result<VectorClock>;

    /// Clean-slate wipe: ops, cursors, applied set. Client id survives
    /// until explicitly replaced.
    fn clear_all(&self) -> Result<()>;

    fn engine_status(&self) -> Result<EngineStatus>;

    fn record_cycle_outcome(&self, record: &CycleRecord) -> Result<()>;

    fn record_engine_error(&self, message: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_serialization_is_tagged_camel_case() {
        let cursor = SyncCursor::File {
            last_sync_version: 3,
            last_mod_rev: Some("etag-1".to_string()),
        };
        let json = serde_json::to_value(&cursor).expect("serialize cursor");
        assert_eq!(json["kind"], "file");
        assert_eq!(json["lastSyncVersion"], 3);
        assert_eq!(json["lastModRev"], "etag-1");

        let back: SyncCursor = serde_json::from_value(json).expect("parse cursor");
        assert_eq!(back, cursor);
    }

    #[test]
    fn initial_cursors_start_at_zero() {
        assert_eq!(
            SyncCursor::initial(CursorKind::ServerSeq),
            SyncCursor::ServerSeq { last_server_seq: 0 }
        );
        assert_eq!(
            SyncCursor::initial(CursorKind::File).kind(),
            CursorKind::File
        );
    }
}
