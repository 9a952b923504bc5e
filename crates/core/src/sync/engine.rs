//! Sync cycle orchestrator: drives download, merge, upload and
//! acknowledge, one cycle at a time, with UI-visible status.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

use crate::domain::AppState;
use crate::errors::{CyclePhase, Result, SyncError};
use crate::sync::adapter::{RejectedOp, SyncAdapter, UploadBatch};
use crate::sync::apply::MergeResolver;
use crate::sync::factory::OpFactory;
use crate::sync::op::{EntityKind, SyncOp};
use crate::sync::store::{CycleRecord, OpLogStore, SyncCursor, RECENT_OPS_CAP, RETENTION_DAYS};
use crate::sync::vector_clock::{ClockOrdering, VectorClock};

/// UI-visible sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Unknown,
    InSync,
    Syncing,
    Error,
}

/// User's answer to a local-data conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictChoice {
    UseLocal,
    UseRemote,
}

/// Outcome of a completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub piggybacked_count: usize,
    pub rejected_ops: Vec<RejectedOp>,
}

/// What a trigger call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResult {
    Completed(CycleResult),
    /// Another cycle holds the mutex; the trigger was dropped, not queued.
    AlreadySyncing,
    /// A privileged operation is blocking sync.
    Blocked,
    /// Provider not ready.
    NotReady,
}

/// Per-phase deadlines.
#[derive(Debug, Clone, Copy)]
pub struct CycleTimeouts {
    pub download: Duration,
    pub upload: Duration,
    pub full_cycle: Duration,
}

impl Default for CycleTimeouts {
    fn default() -> Self {
        Self {
            download: Duration::from_secs(30),
            upload: Duration::from_secs(60),
            full_cycle: Duration::from_secs(120),
        }
    }
}

/// Exponential backoff in seconds with a capped exponent.
pub fn backoff_seconds(consecutive_failures: i32) -> i64 {
    const MAX_EXPONENT: i32 = 8;
    const BASE_DELAY_SECONDS: i64 = 5;

    let capped = i64::from(consecutive_failures.clamp(0, MAX_EXPONENT));
    2_i64.pow(capped as u32) * BASE_DELAY_SECONDS
}

/// Drives one end-to-end sync at a time against the active adapter.
pub struct SyncEngine {
    store: Arc<dyn OpLogStore>,
    adapter: Arc<dyn SyncAdapter>,
    state: Arc<Mutex<AppState>>,
    client_id: std::sync::RwLock<String>,
    status_tx: watch::Sender<SyncStatus>,
    status_rx: watch::Receiver<SyncStatus>,
    cycle_mutex: Mutex<()>,
    /// Privileged operations hold the write side to block new cycles.
    gate: RwLock<()>,
    cancel: AtomicBool,
    timeouts: CycleTimeouts,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn OpLogStore>,
        adapter: Arc<dyn SyncAdapter>,
        state: Arc<Mutex<AppState>>,
    ) -> Result<Self> {
        let client_id = Self::ensure_client_id(store.as_ref())?;
        let (status_tx, status_rx) = watch::channel(SyncStatus::Unknown);
        Ok(Self {
            store,
            adapter,
            state,
            client_id: std::sync::RwLock::new(client_id),
            status_tx,
            status_rx,
            cycle_mutex: Mutex::new(()),
            gate: RwLock::new(()),
            cancel: AtomicBool::new(false),
            timeouts: CycleTimeouts::default(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: CycleTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn ensure_client_id(store: &dyn OpLogStore) -> Result<String> {
        if let Some(id) = store.get_client_id()? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        store.set_client_id(&id)?;
        info!("[Sync] generated client id {}", id);
        Ok(id)
    }

    pub fn client_id(&self) -> String {
        self.client_id.read().expect("client id lock").clone()
    }

    fn factory(&self) -> OpFactory {
        OpFactory::new(self.client_id())
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel for UI status updates.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn set_status(&self, status: SyncStatus) {
        self.status_tx.send_replace(status);
    }

    pub fn is_syncing(&self) -> bool {
        self.status() == SyncStatus::Syncing
    }

    /// Ask the running cycle to stop at its next safe checkpoint.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    pub fn shared_state(&self) -> Arc<Mutex<AppState>> {
        Arc::clone(&self.state)
    }

    /// Persisted engine status (cycle outcomes, failure backoff).
    pub fn store_status(&self) -> Result<crate::sync::store::EngineStatus> {
        self.store.engine_status()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local edits
    // ─────────────────────────────────────────────────────────────────────

    /// Record a whole-entity LWW edit: build the op, persist it, apply it
    /// to local state in production order.
    pub async fn record_local_edit(
        &self,
        entity: EntityKind,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncOp> {
        let factory = self.factory();
        let op = factory.lww_update(self.store.as_ref(), entity, entity_id, payload)?;
        self.store.append(&op)?;
        let mut state = self.state.lock().await;
        MergeResolver::new(&factory, self.store.as_ref())
            .apply_batch(&mut state, std::slice::from_ref(&op))?;
        Ok(op)
    }

    /// Record a local delete, including its cascades.
    pub async fn record_local_delete(
        &self,
        entity: EntityKind,
        entity_id: &str,
    ) -> Result<SyncOp> {
        let factory = self.factory();
        let op = factory.delete(self.store.as_ref(), entity, entity_id)?;
        self.store.append(&op)?;
        let mut state = self.state.lock().await;
        MergeResolver::new(&factory, self.store.as_ref())
            .apply_batch(&mut state, std::slice::from_ref(&op))?;
        Ok(op)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cycle
    // ─────────────────────────────────────────────────────────────────────

    /// Run one sync cycle. Returns immediately when a cycle is already
    /// running or a privileged operation blocks sync.
    pub async fn trigger_sync(&self) -> Result<TriggerResult> {
        let Ok(_gate) = self.gate.try_read() else {
            debug!("[Sync] trigger dropped: sync blocked");
            return Ok(TriggerResult::Blocked);
        };
        let Ok(_cycle) = self.cycle_mutex.try_lock() else {
            debug!("[Sync] trigger dropped: already syncing");
            return Ok(TriggerResult::AlreadySyncing);
        };

        self.cancel.store(false, Ordering::Relaxed);
        self.set_status(SyncStatus::Syncing);
        let started = std::time::Instant::now();

        let outcome = match timeout(self.timeouts.full_cycle, self.run_cycle()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                phase: CyclePhase::FullCycle,
            }),
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(None) => {
                self.set_status(SyncStatus::Unknown);
                self.store.record_cycle_outcome(&CycleRecord {
                    status: "not_ready".to_string(),
                    pushed_count: 0,
                    pulled_count: 0,
                    duration_ms,
                    next_retry_at: None,
                })?;
                Ok(TriggerResult::NotReady)
            }
            Ok(Some(result)) => {
                let status = if result.piggybacked_count == 0 {
                    SyncStatus::InSync
                } else {
                    // Piggybacked remote ops landed after upload; state may
                    // have moved again.
                    SyncStatus::Unknown
                };
                self.set_status(status);
                self.store.record_cycle_outcome(&CycleRecord {
                    status: if status == SyncStatus::InSync {
                        "in_sync".to_string()
                    } else {
                        "piggybacked".to_string()
                    },
                    pushed_count: result.pushed_count,
                    pulled_count: result.pulled_count,
                    duration_ms,
                    next_retry_at: None,
                })?;
                if let Err(err) = self.store.compact(RETENTION_DAYS * 24 * 3600 * 1000) {
                    warn!("[Sync] compaction failed: {}", err);
                }
                Ok(TriggerResult::Completed(result))
            }
            Err(err) => {
                self.set_status(SyncStatus::Error);
                let _ = self.store.record_engine_error(&err.to_string());
                let failures = self
                    .store
                    .engine_status()
                    .map(|s| s.consecutive_failures)
                    .unwrap_or(1);
                let retry_at = (chrono::Utc::now()
                    + chrono::Duration::seconds(backoff_seconds(failures)))
                .to_rfc3339();
                let _ = self.store.record_cycle_outcome(&CycleRecord {
                    status: "error".to_string(),
                    pushed_count: 0,
                    pulled_count: 0,
                    duration_ms,
                    next_retry_at: Some(retry_at),
                });
                Err(err)
            }
        }
    }

    /// The cycle body. `Ok(None)` means the provider was not ready.
    async fn run_cycle(&self) -> Result<Option<CycleResult>> {
        if !self.adapter.is_ready().await {
            debug!("[Sync] provider not ready");
            return Ok(None);
        }
        self.ensure_not_cancelled()?;

        let cursor = self.store.get_cursor(self.adapter.cursor_kind())?;

        // Download phase.
        let batch = match timeout(self.timeouts.download, self.adapter.download_since(&cursor))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::Timeout {
                    phase: CyclePhase::Download,
                })
            }
        };
        self.ensure_not_cancelled()?;

        // Conflict detection: remote summary concurrent with everything we
        // can account for, while unsynced local user ops exist.
        if let Some(remote_clock) = &batch.remote_clock {
            let mut projected = self.store.observed_clock()?;
            for op in &batch.ops {
                projected.merge(&op.vector_clock);
            }
            if let Some(snapshot) = &batch.snapshot {
                projected.merge(&snapshot.vector_clock);
            }
            let unsynced_user = self
                .store
                .get_unsynced()?
                .iter()
                .filter(|op| op.is_user_op())
                .count();
            if unsynced_user > 0
                && remote_clock.compare(&projected) == ClockOrdering::Concurrent
            {
                return Err(SyncError::LocalDataConflict {
                    local_clock: projected,
                    remote_clock: remote_clock.clone(),
                    unsynced_count: unsynced_user,
                });
            }
        }

        let mut pulled = 0_usize;
        {
            let factory = self.factory();
            let resolver = MergeResolver::new(&factory, self.store.as_ref());
            let mut state = self.state.lock().await;

            if let Some(snapshot) = &batch.snapshot {
                if !self.store.has_applied(&snapshot.id)? {
                    resolver.apply_full_state(&mut state, snapshot)?;
                    self.store.record_applied(std::slice::from_ref(snapshot))?;
                    pulled += 1;
                }
            }

            let mut fresh = Vec::new();
            for op in &batch.ops {
                if op.client_id == self.client_id() && self.store.get(&op.id)?.is_some() {
                    continue;
                }
                if !self.store.has_applied(&op.id)? {
                    fresh.push(op.clone());
                }
            }

            if !fresh.is_empty() {
                let report = resolver.apply_batch(&mut state, &fresh)?;
                pulled += report.applied_count();
                self.store.record_applied(&fresh)?;
            }
        }

        // Cursor advances only after apply succeeded and the log flushed.
        self.store.set_cursor(&batch.cursor)?;
        self.ensure_not_cancelled()?;

        // Upload phase.
        let unsynced = self.store.get_unsynced()?;
        let mut result = CycleResult {
            pulled_count: pulled,
            ..CycleResult::default()
        };
        if unsynced.is_empty() {
            return Ok(Some(result));
        }

        let unsynced_ids: HashSet<&str> = unsynced.iter().map(|op| op.id.as_str()).collect();
        let piggyback: Vec<SyncOp> = self
            .store
            .get_recent(RECENT_OPS_CAP)?
            .into_iter()
            .filter(|op| op.is_user_op() && !unsynced_ids.contains(op.id.as_str()))
            .collect();

        let upload_cursor = self.store.get_cursor(self.adapter.cursor_kind())?;
        let upload = UploadBatch {
            ops: unsynced,
            piggyback,
            local_clock: self.store.observed_clock()?,
            is_clean_slate: false,
        };

        let outcome =
            match timeout(self.timeouts.upload, self.adapter.upload(&upload, &upload_cursor))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SyncError::Timeout {
                        phase: CyclePhase::Upload,
                    })
                }
            };

        // Ops discovered during adapter retries are applied before the
        // cycle ends and recorded as applied-remote, never dropped.
        if !outcome.piggybacked.is_empty() {
            let factory = self.factory();
            let resolver = MergeResolver::new(&factory, self.store.as_ref());
            let mut state = self.state.lock().await;
            let mut fresh = Vec::new();
            for op in &outcome.piggybacked {
                if !self.store.has_applied(&op.id)? && self.store.get(&op.id)?.is_none() {
                    fresh.push(op.clone());
                }
            }
            if !fresh.is_empty() {
                resolver.apply_batch(&mut state, &fresh)?;
                self.store.record_applied(&fresh)?;
                result.piggybacked_count = fresh.len();
            }
        }

        if !outcome.accepted.is_empty() {
            self.store.mark_synced(&outcome.accepted)?;
        }
        self.store.set_cursor(&outcome.cursor)?;

        result.pushed_count = outcome.accepted.len();
        result.rejected_ops = outcome.rejected;
        if !result.rejected_ops.is_empty() {
            warn!(
                "[Sync] {} ops rejected by remote, kept unsynced",
                result.rejected_ops.len()
            );
        }
        Ok(Some(result))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Privileged operations
    // ─────────────────────────────────────────────────────────────────────

    /// Wait for any ongoing cycle, then run `fut` with new cycles blocked.
    pub async fn run_with_sync_blocked<T, Fut>(&self, fut: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let _gate = self.gate.write().await;
        let _cycle = self.cycle_mutex.lock().await;
        fut.await
    }

    /// Resolve a `LocalDataConflict` with the user's choice. Pass the
    /// remote clock carried by the conflict error so a keep-local import
    /// causally dominates the remote state it overwrites.
    pub async fn resolve_conflict(
        &self,
        choice: ConflictChoice,
        remote_clock: Option<&VectorClock>,
    ) -> Result<()> {
        let _gate = self.gate.write().await;
        let _cycle = self.cycle_mutex.lock().await;

        match choice {
            ConflictChoice::UseLocal => {
                info!("[Sync] conflict resolved: keep local, uploading full state");
                let full = {
                    let state = self.state.lock().await;
                    serde_json::to_value(&*state)?
                };
                let factory = self.factory();
                // The import clock covers everything observed locally plus
                // the remote components it is overruling.
                let mut clock = self.store.observed_clock()?;
                if let Some(remote) = remote_clock {
                    clock.merge(remote);
                }
                clock.increment(&self.client_id());
                let import = factory.sync_import(clock, full);
                self.store.append(&import)?;

                let unsynced: Vec<String> = self
                    .store
                    .get_unsynced()?
                    .into_iter()
                    .map(|op| op.id)
                    .collect();
                let cursor = self.adapter.upload_full_state(&import, false).await?;
                self.store.mark_synced(&unsynced)?;
                self.store.set_cursor(&cursor)?;
            }
            ConflictChoice::UseRemote => {
                info!("[Sync] conflict resolved: keep remote, discarding local ops");
                let dropped = self.store.discard_unsynced()?;
                debug!("[Sync] discarded {} unsynced ops", dropped.len());
                self.store
                    .set_cursor(&SyncCursor::initial(self.adapter.cursor_kind()))?;
                {
                    let mut state = self.state.lock().await;
                    *state = AppState::default();
                }
                // The next cycle re-downloads from scratch and replays the
                // remote snapshot plus ops.
            }
        }
        self.set_status(SyncStatus::Unknown);
        Ok(())
    }

    /// Clean slate: fresh client id, local full-state import, remote wipe
    /// and re-upload. Used for recoveries and encryption passphrase change.
    pub async fn clean_slate(&self) -> Result<()> {
        let _gate = self.gate.write().await;
        let _cycle = self.cycle_mutex.lock().await;

        let full = {
            let state = self.state.lock().await;
            serde_json::to_value(&*state)?
        };

        let new_client_id = Uuid::new_v4().to_string();
        info!("[Sync] clean slate with new client id {}", new_client_id);
        self.store.clear_all()?;
        self.store.set_client_id(&new_client_id)?;
        *self.client_id.write().expect("client id lock") = new_client_id.clone();

        let factory = OpFactory::new(new_client_id.clone());
        let mut clock = VectorClock::new();
        clock.increment(&new_client_id);
        let import = factory.sync_import(clock, full);
        self.store.append(&import)?;

        let cursor = self.adapter.upload_full_state(&import, true).await?;
        self.store.mark_synced(&[import.id.clone()])?;
        self.store.set_cursor(&cursor)?;
        self.set_status(SyncStatus::Unknown);
        Ok(())
    }
}
