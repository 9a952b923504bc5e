//! Immediate-upload debouncer: coalesces rapid local edits into a single
//! upload cycle.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::sync::config::DEBOUNCE_MS;
use crate::sync::engine::{SyncEngine, SyncStatus, TriggerResult};

/// Debounces `trigger()` calls into one sync cycle per quiet period.
///
/// Every trigger restarts the timer; only the last one fires. Requires a
/// running tokio runtime.
pub struct ImmediateUploadDebouncer {
    engine: Arc<SyncEngine>,
    delay: Duration,
    generation: Arc<AtomicU64>,
}

impl ImmediateUploadDebouncer {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self::with_delay(engine, Duration::from_millis(DEBOUNCE_MS))
    }

    pub fn with_delay(engine: Arc<SyncEngine>, delay: Duration) -> Self {
        Self {
            engine,
            delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Call on every local op. Restarts the debounce window.
    pub fn trigger(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = Arc::clone(&self.engine);
        let latest = Arc::clone(&self.generation);
        let delay = self.delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if latest.load(Ordering::SeqCst) != generation {
                // A newer trigger superseded this one.
                return;
            }
            if engine.is_syncing() {
                // The ongoing cycle will pick the ops up.
                debug!("[Debounce] skipped: sync already in progress");
                return;
            }

            match engine.trigger_sync().await {
                Ok(TriggerResult::Completed(result)) => {
                    // Only advertise IN_SYNC when this burst actually went
                    // up and nothing new came back piggybacked.
                    if result.pushed_count == 0 || result.piggybacked_count > 0 {
                        engine.set_status(SyncStatus::Unknown);
                    }
                }
                Ok(other) => {
                    debug!("[Debounce] cycle skipped: {:?}", other);
                }
                Err(err) => {
                    debug!("[Debounce] cycle failed: {}", err);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AppState;
    use crate::errors::Result;
    use crate::sync::adapter::{
        ProviderKind, RemoteBatch, SyncAdapter, UploadBatch, UploadOutcome,
    };
    use crate::sync::memory::InMemoryOpLog;
    use crate::sync::op::EntityKind;
    use crate::sync::store::{CursorKind, OpLogStore, SyncCursor};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    struct CountingAdapter {
        uploads: AtomicUsize,
    }

    #[async_trait]
    impl SyncAdapter for CountingAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::SuperSync
        }

        fn cursor_kind(&self) -> CursorKind {
            CursorKind::ServerSeq
        }

        async fn is_ready(&self) -> bool {
            true
        }

        async fn download_since(&self, cursor: &SyncCursor) -> Result<RemoteBatch> {
            Ok(RemoteBatch {
                ops: Vec::new(),
                cursor: cursor.clone(),
                remote_clock: None,
                snapshot: None,
            })
        }

        async fn upload(
            &self,
            batch: &UploadBatch,
            cursor: &SyncCursor,
        ) -> Result<UploadOutcome> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(UploadOutcome {
                accepted: batch.ops.iter().map(|op| op.id.clone()).collect(),
                rejected: Vec::new(),
                piggybacked: Vec::new(),
                cursor: cursor.clone(),
            })
        }

        async fn upload_full_state(
            &self,
            _snapshot: &crate::sync::op::SyncOp,
            _clean_slate: bool,
        ) -> Result<SyncCursor> {
            Ok(SyncCursor::ServerSeq { last_server_seq: 1 })
        }
    }

    #[tokio::test]
    async fn rapid_triggers_coalesce_into_one_cycle() {
        let store: Arc<dyn OpLogStore> = Arc::new(InMemoryOpLog::new());
        let adapter = Arc::new(CountingAdapter {
            uploads: AtomicUsize::new(0),
        });
        let engine = Arc::new(
            SyncEngine::new(
                Arc::clone(&store),
                Arc::clone(&adapter) as Arc<dyn SyncAdapter>,
                Arc::new(Mutex::new(AppState::default())),
            )
            .expect("engine"),
        );

        engine
            .record_local_edit(
                EntityKind::Task,
                "t1",
                serde_json::json!({ "id": "t1", "title": "a" }),
            )
            .await
            .expect("edit 1");

        let debouncer =
            ImmediateUploadDebouncer::with_delay(Arc::clone(&engine), Duration::from_millis(30));
        for _ in 0..5 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(adapter.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(engine.status(), SyncStatus::InSync);
        assert!(store.get_unsynced().expect("unsynced").is_empty());
    }

    #[tokio::test]
    async fn nothing_uploaded_does_not_advertise_in_sync() {
        let store: Arc<dyn OpLogStore> = Arc::new(InMemoryOpLog::new());
        let adapter = Arc::new(CountingAdapter {
            uploads: AtomicUsize::new(0),
        });
        let engine = Arc::new(
            SyncEngine::new(
                Arc::clone(&store),
                Arc::clone(&adapter) as Arc<dyn SyncAdapter>,
                Arc::new(Mutex::new(AppState::default())),
            )
            .expect("engine"),
        );

        let debouncer =
            ImmediateUploadDebouncer::with_delay(Arc::clone(&engine), Duration::from_millis(10));
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // No local ops existed, so the empty cycle must not claim IN_SYNC.
        assert_eq!(adapter.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(engine.status(), SyncStatus::Unknown);
    }
}
