//! `SyncAdapter` implementation speaking the op-sync server protocol.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use daystack_core::errors::{Result as CoreResult, SyncError};
use daystack_core::sync::{
    CursorKind, PayloadProtector, ProviderKind, RemoteBatch, SyncAdapter, SyncCursor, SyncOp,
    UploadBatch, UploadOutcome, VectorClock, CURRENT_SCHEMA_VERSION,
};
use daystack_core::sync::{EntityKind, OpType};

use crate::client::OpSyncClient;
use crate::error::{ApiRetryClass, Result};
use crate::types::*;

const MAX_PUSH_ATTEMPTS: usize = 3;
const PUSH_BASE_BACKOFF_MS: u64 = 250;
const PUSH_MAX_BACKOFF_MS: u64 = 4_000;

fn push_backoff_with_jitter(attempt: usize) -> Duration {
    let exp = (attempt.saturating_sub(1) as u32).min(8);
    let backoff =
        (PUSH_BASE_BACKOFF_MS.saturating_mul(1_u64 << exp)).min(PUSH_MAX_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..=(backoff / 5).max(1));
    Duration::from_millis(backoff.saturating_add(jitter))
}

/// Supplies and refreshes the bearer token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;

    /// One-shot refresh after a transient 401.
    async fn refresh_token(&self) -> Result<String>;
}

/// Fixed-token provider for tests and long-lived tokens.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Sequence-number-based back-end against the op-sync server.
pub struct OpSyncAdapter {
    client: OpSyncClient,
    tokens: Arc<dyn TokenProvider>,
    protector: Arc<PayloadProtector>,
    client_id: String,
}

impl OpSyncAdapter {
    pub fn new(
        client: OpSyncClient,
        tokens: Arc<dyn TokenProvider>,
        protector: Arc<PayloadProtector>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            protector,
            client_id: client_id.into(),
        }
    }

    /// Run an authenticated call, refreshing the token once on a 401.
    async fn with_auth<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let token = self.tokens.access_token().await?;
        match call(token).await {
            Err(err) if err.status_code() == Some(401) => {
                debug!("[OpSync] 401 received, refreshing token once");
                let token = self.tokens.refresh_token().await?;
                call(token).await
            }
            other => other,
        }
    }

    pub(crate) fn encode_op(&self, op: &SyncOp) -> CoreResult<WireOp> {
        let cfg = self.protector.config();
        if !cfg.is_encryption_enabled && !cfg.is_compression_enabled {
            return Ok(WireOp::Plain(op.clone()));
        }
        let sealed = self.protector.seal(&serde_json::to_vec(op)?)?;
        Ok(WireOp::Encrypted(EncryptedOp {
            encrypted_data: BASE64.encode(sealed),
        }))
    }

    pub(crate) fn decode_op(&self, wire: WireOp) -> CoreResult<SyncOp> {
        match wire {
            WireOp::Plain(op) => {
                if self.protector.config().is_encryption_enabled {
                    return Err(SyncError::EncryptionStateMismatch {
                        remote_encrypted: false,
                        local_encrypted: true,
                    });
                }
                Ok(op)
            }
            WireOp::Encrypted(enc) => {
                let bytes = BASE64
                    .decode(&enc.encrypted_data)
                    .map_err(|e| SyncError::envelope(format!("invalid op encoding: {}", e)))?;
                let opened = self.protector.open(&bytes)?;
                Ok(serde_json::from_slice(&opened)?)
            }
        }
    }

    fn seq_of(cursor: &SyncCursor) -> i64 {
        match cursor {
            SyncCursor::ServerSeq { last_server_seq } => *last_server_seq,
            _ => 0,
        }
    }

    /// Build the bootstrap import op for a server snapshot. The snapshot's
    /// clock is taken as-is so this client's own historic component stays
    /// preserved.
    fn snapshot_to_import(
        &self,
        state: serde_json::Value,
        clock: VectorClock,
        server_seq: i64,
    ) -> SyncOp {
        SyncOp {
            id: format!("snapshot@{}", server_seq),
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

    /// Server-side wipe, used by the encryption-change flow.
    pub async fn delete_all_remote(&self) -> CoreResult<()> {
        let response = self
            .with_auth(|token| {
                let client = self.client.clone();
                async move { client.delete_all(&token).await }
            })
            .await
            .map_err(SyncError::from)?;
        if !response.success {
            return Err(SyncError::network("server declined wipe request"));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncAdapter for OpSyncAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SuperSync
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::ServerSeq
    }

    async fn is_ready(&self) -> bool {
        self.tokens.access_token().await.is_ok()
    }

    async fn download_since(&self, cursor: &SyncCursor) -> CoreResult<RemoteBatch> {
        let since = Self::seq_of(cursor);
        let response = self
            .with_auth(|token| {
                let client = self.client.clone();
                async move { client.get_ops(&token, since).await }
            })
            .await
            .map_err(SyncError::from)?;

        if response.is_migration.unwrap_or(false) {
            info!("[OpSync] server reports migrated history, full pull follows");
        }

        let mut remote_clock = VectorClock::new();
        let mut has_summary = false;
        let mut ops = Vec::with_capacity(response.ops.len());
        for wire in response.ops {
            let op = self.decode_op(wire)?;
            remote_clock.merge(&op.vector_clock);
            has_summary = true;
            ops.push(op);
        }

        let snapshot = if since == 0 {
            response.snapshot_state.map(|state| {
                let clock = response.snapshot_clock.clone().unwrap_or_default();
                remote_clock.merge(&clock);
                has_summary = true;
                self.snapshot_to_import(state, clock, response.server_seq)
            })
        } else {
            None
        };

        Ok(RemoteBatch {
            ops,
            cursor: SyncCursor::ServerSeq {
                last_server_seq: response.server_seq,
            },
            remote_clock: has_summary.then_some(remote_clock),
            snapshot,
        })
    }

    async fn upload(
        &self,
        batch: &UploadBatch,
        cursor: &SyncCursor,
    ) -> CoreResult<UploadOutcome> {
        let mut wire_ops = Vec::with_capacity(batch.ops.len() + batch.piggyback.len());
        for op in batch.ops.iter().chain(batch.piggyback.iter()) {
            wire_ops.push(self.encode_op(op)?);
        }

        let local_ids: HashSet<&str> = batch
            .ops
            .iter()
            .chain(batch.piggyback.iter())
            .map(|op| op.id.as_str())
            .collect();

        let mut since = Self::seq_of(cursor);
        let mut piggybacked: Vec<SyncOp> = Vec::new();
        let mut attempt = 0_usize;

        loop {
            attempt += 1;
            let request = OpsPushRequest {
                ops: wire_ops.clone(),
                vector_clock_at_upload: batch.local_clock.clone(),
                is_clean_slate: batch.is_clean_slate.then_some(true),
            };

            let push_result = self
                .with_auth(|token| {
                    let client = self.client.clone();
                    let request = request.clone();
                    async move { client.post_ops(&token, &request).await }
                })
                .await;

            match push_result {
                Ok(response) => {
                    let rejected = response.rejected_ops.unwrap_or_default();
                    let rejected_ids: HashSet<&str> =
                        rejected.iter().map(|r| r.id.as_str()).collect();
                    let accepted: Vec<String> = if response.accepted {
                        batch
                            .ops
                            .iter()
                            .filter(|op| !rejected_ids.contains(op.id.as_str()))
                            .map(|op| op.id.clone())
                            .collect()
                    } else {
                        Vec::new()
                    };

                    for wire in response.piggybacked_ops.unwrap_or_default() {
                        let op = self.decode_op(wire)?;
                        if op.client_id != self.client_id
                            && !local_ids.contains(op.id.as_str())
                            && !piggybacked.iter().any(|seen| seen.id == op.id)
                        {
                            piggybacked.push(op);
                        }
                    }

                    return Ok(UploadOutcome {
                        accepted,
                        rejected,
                        piggybacked,
                        cursor: SyncCursor::ServerSeq {
                            last_server_seq: response.server_seq,
                        },
                    });
                }
                Err(err)
                    if matches!(err.retry_class(), ApiRetryClass::Retryable)
                        && attempt < MAX_PUSH_ATTEMPTS =>
                {
                    debug!(
                        "[OpSync] push attempt {}/{} failed ({}), refetching before retry",
                        attempt, MAX_PUSH_ATTEMPTS, err
                    );
                    // Refetch so the retry carries everything the server saw
                    // in the meantime; collected ops come back to the caller.
                    match self
                        .with_auth(|token| {
                            let client = self.client.clone();
                            async move { client.get_ops(&token, since).await }
                        })
                        .await
                    {
                        Ok(pull) => {
                            since = pull.server_seq;
                            for wire in pull.ops {
                                let op = self.decode_op(wire)?;
                                if op.client_id != self.client_id
                                    && !local_ids.contains(op.id.as_str())
                                    && !piggybacked.iter().any(|seen| seen.id == op.id)
                                {
                                    piggybacked.push(op);
                                }
                            }
                        }
                        Err(pull_err) => {
                            debug!("[OpSync] refetch during retry failed: {}", pull_err);
                        }
                    }
                    sleep(push_backoff_with_jitter(attempt)).await;
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
        let request = SnapshotUploadRequest {
            snapshot: self.encode_op(snapshot)?,
            vector_clock: snapshot.vector_clock.clone(),
            is_clean_slate: clean_slate.then_some(true),
        };
        let response = self
            .with_auth(|token| {
                let client = self.client.clone();
                let request = request.clone();
                async move { client.post_snapshot(&token, &request).await }
            })
            .await
            .map_err(SyncError::from)?;
        Ok(SyncCursor::ServerSeq {
            last_server_seq: response.server_seq,
        })
    }
}
