//! Adapter contract: the surface the orchestrator drives, implemented by
//! the file-based and op-sync back-ends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::sync::op::SyncOp;
use crate::sync::store::{CursorKind, SyncCursor};
use crate::sync::vector_clock::VectorClock;

/// Closed set of supported sync providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Dropbox,
    Webdav,
    LocalFile,
    SuperSync,
}

/// Remote ops downloaded since a cursor, plus the summary state used for
/// conflict detection.
#[derive(Debug, Clone)]
pub struct RemoteBatch {
    /// Remote ops in server- or file-provided order.
    pub ops: Vec<SyncOp>,
    /// Cursor to persist once every op is applied and flushed.
    pub cursor: SyncCursor,
    /// Remote summary clock (container clock or snapshot clock), when the
    /// protocol exposes one.
    pub remote_clock: Option<VectorClock>,
    /// Full-state bootstrap op, present on first contact with a snapshot.
    pub snapshot: Option<SyncOp>,
}

/// Ops handed to an adapter for upload.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    /// Unsynced local ops, insertion order.
    pub ops: Vec<SyncOp>,
    /// Recently synced user ops re-sent for peers with stale cursors.
    pub piggyback: Vec<SyncOp>,
    /// Local clock at upload time.
    pub local_clock: VectorClock,
    pub is_clean_slate: bool,
}

/// A per-op rejection (schema mismatch, server policy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOp {
    pub id: String,
    pub reason: String,
}

/// Result of an upload. Every op the orchestrator handed in is either in
/// `accepted` or in `rejected`; ops the adapter discovered while retrying
/// come back in `piggybacked` and must be applied before the cycle ends.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedOp>,
    pub piggybacked: Vec<SyncOp>,
    pub cursor: SyncCursor,
}

/// Back-end surface the orchestrator drives. Implementations absorb their
/// own transient faults; only unrecoverable kinds propagate.
#[async_trait]
pub trait SyncAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn cursor_kind(&self) -> CursorKind;

    /// Provider configured and reachable enough to attempt a cycle.
    async fn is_ready(&self) -> bool;

    /// Fetch remote ops after `cursor`.
    async fn download_since(&self, cursor: &SyncCursor) -> Result<RemoteBatch>;

    /// Upload a batch. Internal retries must collect piggybacked ops from
    /// the latest refetch, never from a stale pre-retry snapshot.
    async fn upload(&self, batch: &UploadBatch, cursor: &SyncCursor) -> Result<UploadOutcome>;

    /// Replace remote state wholesale (clean slate, conflict resolution,
    /// encryption state change).
    async fn upload_full_state(&self, snapshot: &SyncOp, clean_slate: bool)
        -> Result<SyncCursor>;
}
