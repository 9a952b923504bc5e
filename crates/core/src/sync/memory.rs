//! In-memory op log with the same semantics as the durable store. Used by
//! tests and embedded callers that do not need persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::errors::{Result, SyncError};
use crate::sync::op::SyncOp;
use crate::sync::store::{
    CursorKind, CycleRecord, EngineStatus, OpLogStore, StoredOp, SyncCursor, RECENT_OPS_CAP,
};
use crate::sync::vector_clock::VectorClock;

#[derive(Default)]
struct Inner {
    ops: BTreeMap<String, StoredOp>,
    order: Vec<String>,
    next_seq: i64,
    applied: HashSet<String>,
    cursors: HashMap<CursorKind, SyncCursor>,
    client_id: Option<String>,
    observed: VectorClock,
    engine: EngineStatus,
}

impl Inner {
    fn insert(&mut self, op: &SyncOp, is_synced: bool, applied_remote: bool) {
        if self.ops.contains_key(&op.id) {
            return;
        }
        self.next_seq += 1;
        self.observed.merge(&op.vector_clock);
        self.ops.insert(
            op.id.clone(),
            StoredOp {
                op: op.clone(),
                local_seq: self.next_seq,
                is_synced,
                applied_remote,
            },
        );
        self.order.push(op.id.clone());
    }
}

/// Reference `OpLogStore` backed by process memory.
#[derive(Default)]
pub struct InMemoryOpLog {
    inner: Mutex<Inner>,
}

impl InMemoryOpLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::storage("op log mutex poisoned"))
    }
}

impl OpLogStore for InMemoryOpLog {
    fn append(&self, op: &SyncOp) -> Result<()> {
        let mut inner = self.lock()?;
        inner.insert(op, false, false);
        Ok(())
    }

    fn append_batch(&self, ops: &[SyncOp]) -> Result<()> {
        let mut inner = self.lock()?;
        for op in ops {
            inner.insert(op, false, false);
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StoredOp>> {
        Ok(self.lock()?.ops.get(id).cloned())
    }

    fn get_unsynced(&self) -> Result<Vec<SyncOp>> {
        let inner = self.lock()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.ops.get(id))
            .filter(|stored| !stored.is_synced)
            .map(|stored| stored.op.clone())
            .collect())
    }

    fn get_recent(&self, n: usize) -> Result<Vec<SyncOp>> {
        let inner = self.lock()?;
        let start = inner.order.len().saturating_sub(n);
        Ok(inner.order[start..]
            .iter()
            .filter_map(|id| inner.ops.get(id))
            .map(|stored| stored.op.clone())
            .collect())
    }

    fn mark_synced(&self, ids: &[String]) -> Result<()> {
        let mut inner = self.lock()?;
        for id in ids {
            if !inner.ops.contains_key(id) {
                return Err(SyncError::storage(format!(
                    "mark_synced: unknown op id {}",
                    id
                )));
            }
        }
        for id in ids {
            if let Some(stored) = inner.ops.get_mut(id) {
                stored.is_synced = true;
            }
        }
        Ok(())
    }

    fn has_applied(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.applied.contains(id))
    }

    fn record_applied(&self, ops: &[SyncOp]) -> Result<()> {
        let mut inner = self.lock()?;
        for op in ops {
            inner.insert(op, true, true);
            if let Some(stored) = inner.ops.get_mut(&op.id) {
                stored.applied_remote = true;
                stored.is_synced = true;
            }
            inner.applied.insert(op.id.clone());
            inner.observed.merge(&op.vector_clock);
        }
        Ok(())
    }

    fn discard_unsynced(&self) -> Result<Vec<String>> {
        let mut inner = self.lock()?;
        let dropped: Vec<String> = inner
            .order
            .iter()
            .filter(|id| inner.ops.get(*id).is_some_and(|s| !s.is_synced))
            .cloned()
            .collect();
        for id in &dropped {
            inner.ops.remove(id);
        }
        inner.order.retain(|id| !dropped.contains(id));
        Ok(dropped)
    }

    fn compact(&self, retention_ms: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        let now = chrono::Utc::now().timestamp_millis();
        let keep_from = inner.order.len().saturating_sub(RECENT_OPS_CAP);
        let protected: HashSet<String> = inner.order[keep_from..].iter().cloned().collect();

        let dropped: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                if protected.contains(*id) {
                    return false;
                }
                inner
                    .ops
                    .get(*id)
                    .is_some_and(|s| s.is_synced && now - s.op.timestamp > retention_ms)
            })
            .cloned()
            .collect();
        for id in &dropped {
            inner.ops.remove(id);
        }
        inner.order.retain(|id| !dropped.contains(id));
        Ok(dropped.len())
    }

    fn get_cursor(&self, kind: CursorKind) -> Result<SyncCursor> {
        Ok(self
            .lock()?
            .cursors
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| SyncCursor::initial(kind)))
    }

    fn set_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.lock()?.cursors.insert(cursor.kind(), cursor.clone());
        Ok(())
    }

    fn get_client_id(&self) -> Result<Option<String>> {
        Ok(self.lock()?.client_id.clone())
    }

    fn set_client_id(&self, id: &str) -> Result<()> {
        self.lock()?.client_id = Some(id.to_string());
        Ok(())
    }

    fn observed_clock(&self) -> Result<VectorClock> {
        Ok(self.lock()?.observed.clone())
    }

    fn clear_all(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let client_id = inner.client_id.take();
        *inner = Inner::default();
        inner.client_id = client_id;
        Ok(())
    }

    fn engine_status(&self) -> Result<EngineStatus> {
        Ok(self.lock()?.engine.clone())
    }

    fn record_cycle_outcome(&self, record: &CycleRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        if record.pushed_count > 0 {
            inner.engine.last_push_at = Some(now.clone());
        }
        if record.pulled_count > 0 {
            inner.engine.last_pull_at = Some(now);
        }
        inner.engine.last_cycle_status = Some(record.status.clone());
        inner.engine.last_cycle_duration_ms = Some(record.duration_ms);
        inner.engine.next_retry_at = record.next_retry_at.clone();
        if record.next_retry_at.is_none() {
            inner.engine.consecutive_failures = 0;
            inner.engine.last_error = None;
        }
        Ok(())
    }

    fn record_engine_error(&self, message: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.engine.last_error = Some(message.to_string());
        inner.engine.consecutive_failures += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::op::{EntityKind, OpType, CURRENT_SCHEMA_VERSION};

    fn op(id: &str, client: &str, component: u64) -> SyncOp {
        SyncOp {
            id: id.to_string(),
            client_id: client.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            vector_clock: [(client.to_string(), component)].into_iter().collect(),
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_type: EntityKind::Task,
            entity_id: "t1".to_string(),
            op_type: OpType::LwwUpdate,
            action_type: "[TASK] LWW Update".to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn append_is_idempotent_by_id() {
        let store = InMemoryOpLog::new();
        let o = op("op-1", "a", 1);
        store.append(&o).expect("first");
        store.append(&o).expect("second");
        assert_eq!(store.get_recent(10).expect("recent").len(), 1);
    }

    #[test]
    fn unsynced_preserves_insertion_order() {
        let store = InMemoryOpLog::new();
        store.append(&op("op-1", "a", 1)).expect("1");
        store.append(&op("op-2", "a", 2)).expect("2");
        store.mark_synced(&["op-1".to_string()]).expect("mark");
        let unsynced = store.get_unsynced().expect("unsynced");
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, "op-2");
    }

    #[test]
    fn mark_synced_is_all_or_nothing() {
        let store = InMemoryOpLog::new();
        store.append(&op("op-1", "a", 1)).expect("1");
        let err = store
            .mark_synced(&["op-1".to_string(), "missing".to_string()])
            .expect_err("unknown id must fail");
        assert!(matches!(err, SyncError::Storage(_)));
        assert_eq!(store.get_unsynced().expect("unsynced").len(), 1);
    }

    #[test]
    fn record_applied_merges_observed_clock() {
        let store = InMemoryOpLog::new();
        store.record_applied(&[op("op-1", "peer", 4)]).expect("record");
        assert!(store.has_applied("op-1").expect("has"));
        assert_eq!(store.observed_clock().expect("clock").get("peer"), 4);
    }

    #[test]
    fn compact_protects_recent_and_unsynced_ops() {
        let store = InMemoryOpLog::new();
        let mut old = op("op-old", "a", 1);
        old.timestamp = 0;
        store.append(&old).expect("old");
        store.mark_synced(&["op-old".to_string()]).expect("mark");
        // Within the recent window: protected despite age.
        assert_eq!(store.compact(1000).expect("compact"), 0);
    }

    #[test]
    fn clear_all_keeps_client_id() {
        let store = InMemoryOpLog::new();
        store.set_client_id("client-a").expect("set");
        store.append(&op("op-1", "a", 1)).expect("append");
        store.clear_all().expect("clear");
        assert_eq!(
            store.get_client_id().expect("get"),
            Some("client-a".to_string())
        );
        assert!(store.get_recent(10).expect("recent").is_empty());
    }
}
