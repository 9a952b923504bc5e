//! `SyncAdapter` implementation over a generic file store.

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use daystack_core::domain::AppState;
use daystack_core::errors::{Result as CoreResult, SyncError};
use daystack_core::sync::{
    CursorKind, EntityKind, OpType, PayloadProtector, ProviderKind, RemoteBatch, SyncAdapter,
    SyncCursor, SyncOp, UploadBatch, UploadOutcome, VectorClock, CURRENT_SCHEMA_VERSION,
};

use crate::container::{SyncContainer, SYNC_DATA_FILE};
use crate::provider::{FileProviderError, FileStoreProvider};

const MAX_UPLOAD_RETRIES: usize = 4;
const RETRY_BASE_BACKOFF_MS: u64 = 200;
/// Refresh the in-file snapshot every this many container versions.
const SNAPSHOT_REFRESH_EVERY: u64 = 20;

/// Randomized exponential backoff, ±25 % jitter.
fn retry_backoff_with_jitter(attempt: usize) -> Duration {
    let exp = (attempt.saturating_sub(1) as u32).min(6);
    let base = RETRY_BASE_BACKOFF_MS.saturating_mul(1_u64 << exp);
    let span = (base / 4).max(1);
    let millis = rand::thread_rng().gen_range(base - span..=base + span);
    Duration::from_millis(millis)
}

/// File-based back-end writing one shared JSON container.
pub struct FileSyncAdapter {
    provider: Arc<dyn FileStoreProvider>,
    protector: Arc<PayloadProtector>,
    /// Shared application state, read for opportunistic snapshot refresh.
    state: Arc<Mutex<AppState>>,
    kind: ProviderKind,
    client_id: String,
    sync_file_path: String,
    /// Set once the store demonstrably cannot enforce preconditions; the
    /// in-file `syncVersion` becomes the conflict signal.
    conditional_unsupported: AtomicBool,
    /// Parent directories created this session; guarded by a mutex so
    /// concurrent requests to the same path coalesce.
    created_dirs: Mutex<HashSet<String>>,
    /// Last downloaded container, reused by the upload that follows.
    cache: Mutex<Option<(SyncContainer, String)>>,
}

impl FileSyncAdapter {
    pub fn new(
        provider: Arc<dyn FileStoreProvider>,
        protector: Arc<PayloadProtector>,
        state: Arc<Mutex<AppState>>,
        kind: ProviderKind,
        sync_folder_path: &str,
        client_id: impl Into<String>,
    ) -> Self {
        let folder = sync_folder_path.trim_matches('/');
        let sync_file_path = if folder.is_empty() {
            SYNC_DATA_FILE.to_string()
        } else {
            format!("{}/{}", folder, SYNC_DATA_FILE)
        };
        Self {
            provider,
            protector,
            state,
            kind,
            client_id: client_id.into(),
            sync_file_path,
            conditional_unsupported: AtomicBool::new(false),
            created_dirs: Mutex::new(HashSet::new()),
            cache: Mutex::new(None),
        }
    }

    pub fn sync_file_path(&self) -> &str {
        &self.sync_file_path
    }

    async fn fetch_remote(&self) -> CoreResult<Option<(SyncContainer, String)>> {
        match self.provider.download_file(&self.sync_file_path).await {
            Ok(file) => {
                if file.rev.is_empty() && !self.conditional_unsupported.swap(true, Ordering::Relaxed)
                {
                    info!("[FileSync] store exposes no revision, falling back to syncVersion");
                }
                let container = SyncContainer::decode(&file.data, &self.protector)?;
                let mut cache = self.cache.lock().await;
                *cache = Some((container.clone(), file.rev.clone()));
                Ok(Some((container, file.rev)))
            }
            Err(FileProviderError::NotFound(_)) => {
                let mut cache = self.cache.lock().await;
                *cache = None;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create missing parents at most once per session.
    async fn ensure_parent_dirs(&self) -> CoreResult<()> {
        let Some((parent, _)) = self.sync_file_path.rsplit_once('/') else {
            return Ok(());
        };
        let mut created = self.created_dirs.lock().await;
        if created.contains(parent) {
            return Ok(());
        }
        self.provider
            .create_dir(parent)
            .await
            .map_err(SyncError::from)?;
        created.insert(parent.to_string());
        Ok(())
    }

    fn snapshot_to_import(
        &self,
        state: serde_json::Value,
        clock: VectorClock,
        sync_version: u64,
    ) -> SyncOp {
        SyncOp {
            id: format!("snapshot@{}", sync_version),
            client_id: self.client_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            vector_clock: clock,
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_type: EntityKind::All,
            entity_id: String::new(),
            op_type: OpType::SyncImport,
            action_type: SyncOp::action_label(EntityKind::All, OpType::SyncImport),
            payload: state,
        }
    }

    fn use_version_check(&self) -> bool {
        !self.provider.supports_conditional_writes()
            || self.conditional_unsupported.load(Ordering::Relaxed)
    }

    fn collect_piggyback(
        &self,
        container: &SyncContainer,
        local_ids: &HashSet<&str>,
        piggybacked: &mut Vec<SyncOp>,
    ) {
        for op in &container.recent_ops {
            if op.client_id != self.client_id
                && !local_ids.contains(op.id.as_str())
                && !piggybacked.iter().any(|seen| seen.id == op.id)
            {
                piggybacked.push(op.clone());
            }
        }
    }

    async fn refresh_snapshot(&self, container: &mut SyncContainer) -> CoreResult<()> {
        let state = self.state.lock().await;
        container.snapshot_state = Some(serde_json::to_value(&*state)?);
        container.snapshot_clock = Some(container.vector_clock.clone());
        Ok(())
    }
}

#[async_trait]
impl SyncAdapter for FileSyncAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::File
    }

    async fn is_ready(&self) -> bool {
        self.provider.is_ready().await
    }

    async fn download_since(&self, cursor: &SyncCursor) -> CoreResult<RemoteBatch> {
        let last_version = match cursor {
            SyncCursor::File {
                last_sync_version, ..
            } => *last_sync_version,
            _ => 0,
        };

        let Some((container, rev)) = self.fetch_remote().await? else {
            return Ok(RemoteBatch {
                ops: Vec::new(),
                cursor: SyncCursor::File {
                    last_sync_version: last_version,
                    last_mod_rev: None,
                },
                remote_clock: None,
                snapshot: None,
            });
        };

        // A remote version below our cursor means the container was reset
        // by a peer; re-bootstrap from its snapshot.
        let bootstrap = last_version == 0 || container.sync_version < last_version;
        if container.sync_version < last_version {
            warn!(
                "[FileSync] remote container reset ({} < {}), re-bootstrapping",
                container.sync_version, last_version
            );
        }

        let snapshot = if bootstrap {
            container.snapshot_state.clone().map(|state| {
                let clock = container
                    .snapshot_clock
                    .clone()
                    .unwrap_or_else(|| container.vector_clock.clone());
                self.snapshot_to_import(state, clock, container.sync_version)
            })
        } else {
            None
        };

        let ops = if container.sync_version == last_version {
            Vec::new()
        } else {
            container.recent_ops.clone()
        };

        Ok(RemoteBatch {
            ops,
            cursor: SyncCursor::File {
                last_sync_version: container.sync_version,
                last_mod_rev: Some(rev),
            },
            remote_clock: Some(container.vector_clock.clone()),
            snapshot,
        })
    }

    async fn upload(
        &self,
        batch: &UploadBatch,
        cursor: &SyncCursor,
    ) -> CoreResult<UploadOutcome> {
        self.ensure_parent_dirs().await?;

        let cursor_rev = match cursor {
            SyncCursor::File { last_mod_rev, .. } => last_mod_rev.clone(),
            _ => None,
        };
        let local_ids: HashSet<&str> = batch
            .ops
            .iter()
            .chain(batch.piggyback.iter())
            .map(|op| op.id.as_str())
            .collect();

        let mut piggybacked: Vec<SyncOp> = Vec::new();
        // Reuse the container captured by the download phase when its rev
        // still matches the cursor.
        let mut prefetched: Option<(SyncContainer, String)> = {
            let cache = self.cache.lock().await;
            cache
                .clone()
                .filter(|(_, rev)| cursor_rev.as_deref() == Some(rev.as_str()))
        };

        let mut attempt = 0_usize;
        loop {
            attempt += 1;

            let fetched = match prefetched.take() {
                Some(hit) => Some(hit),
                None => self.fetch_remote().await?,
            };
            let (mut container, current_rev) = fetched.unwrap_or_else(|| {
                (
                    SyncContainer {
                        client_id: self.client_id.clone(),
                        ..SyncContainer::default()
                    },
                    String::new(),
                )
            });

            // Always from the freshest copy, never a pre-retry snapshot.
            self.collect_piggyback(&container, &local_ids, &mut piggybacked);

            container.merge_recent_ops(batch.ops.iter().chain(batch.piggyback.iter()));
            container.sync_version += 1;
            container.client_id = self.client_id.clone();
            container.vector_clock.merge(&batch.local_clock);
            if container.snapshot_state.is_none()
                || container.sync_version % SNAPSHOT_REFRESH_EVERY == 0
            {
                self.refresh_snapshot(&mut container).await?;
            }

            let sealed = container.encode(&self.protector)?;
            let (expected_rev, force) = if self.use_version_check() {
                // No usable preconditions: last fetch carried the freshest
                // syncVersion, write through.
                (None, true)
            } else if current_rev.is_empty() {
                // No remote file yet: create-only.
                (None, false)
            } else {
                (Some(current_rev.as_str()), false)
            };

            match self
                .provider
                .upload_file(&self.sync_file_path, &sealed, expected_rev, force)
                .await
            {
                Ok(new_rev) => {
                    {
                        let mut cache = self.cache.lock().await;
                        *cache = Some((container.clone(), new_rev.clone()));
                    }
                    debug!(
                        "[FileSync] uploaded v{} ({} ops, {} piggybacked, attempt {})",
                        container.sync_version,
                        batch.ops.len(),
                        piggybacked.len(),
                        attempt
                    );
                    return Ok(UploadOutcome {
                        accepted: batch.ops.iter().map(|op| op.id.clone()).collect(),
                        rejected: Vec::new(),
                        piggybacked,
                        cursor: SyncCursor::File {
                            last_sync_version: container.sync_version,
                            last_mod_rev: Some(new_rev),
                        },
                    });
                }
                Err(err)
                    if (err.is_rev_mismatch()
                        || matches!(err, FileProviderError::Transient(_)))
                        && attempt < MAX_UPLOAD_RETRIES =>
                {
                    debug!(
                        "[FileSync] upload attempt {}/{} failed ({}), refetching",
                        attempt, MAX_UPLOAD_RETRIES, err
                    );
                    sleep(retry_backoff_with_jitter(attempt)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn upload_full_state(
        &self,
        snapshot: &SyncOp,
        clean_slate: bool,
    ) -> CoreResult<SyncCursor> {
        self.ensure_parent_dirs().await?;

        let prev_version = match self.fetch_remote().await {
            Ok(Some((container, _))) => container.sync_version,
            Ok(None) => 0,
            Err(err) if clean_slate => {
                // A clean slate overwrites whatever is there, unreadable
                // included (encryption passphrase change).
                debug!("[FileSync] ignoring unreadable remote on clean slate: {}", err);
                0
            }
            Err(err) => return Err(err),
        };

        let state_payload = snapshot
            .full_state_payload()
            .cloned()
            .unwrap_or_else(|| snapshot.payload.clone());
        let container = SyncContainer {
            sync_version: prev_version + 1,
            vector_clock: snapshot.vector_clock.clone(),
            client_id: self.client_id.clone(),
            snapshot_state: Some(state_payload),
            snapshot_clock: Some(snapshot.vector_clock.clone()),
            recent_ops: Vec::new(),
            archive_young: None,
            archive_old: None,
        };
        let sealed = container.encode(&self.protector)?;
        let new_rev = self
            .provider
            .upload_file(&self.sync_file_path, &sealed, None, true)
            .await
            .map_err(SyncError::from)?;

        {
            let mut cache = self.cache.lock().await;
            *cache = Some((container.clone(), new_rev.clone()));
        }
        info!(
            "[FileSync] full-state upload v{} (clean_slate={})",
            container.sync_version, clean_slate
        );
        Ok(SyncCursor::File {
            last_sync_version: container.sync_version,
            last_mod_rev: Some(new_rev),
        })
    }
}
