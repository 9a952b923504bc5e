//! LWW operation factory: constructs well-formed, clock-stamped ops.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::Result;
use crate::sync::op::{EntityKind, OpType, SyncOp, CURRENT_SCHEMA_VERSION};
use crate::sync::store::OpLogStore;
use crate::sync::vector_clock::VectorClock;

/// Builds operations stamped with the current causal clock.
#[derive(Debug, Clone)]
pub struct OpFactory {
    client_id: String,
}

impl OpFactory {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The clock that stamps the next locally produced op: everything
    /// observed so far, incremented on our own component.
    pub fn next_clock(&self, store: &dyn OpLogStore) -> Result<VectorClock> {
        let mut clock = store.observed_clock()?;
        clock.increment(&self.client_id);
        Ok(clock)
    }

    fn build(
        &self,
        clock: VectorClock,
        entity: EntityKind,
        entity_id: impl Into<String>,
        op_type: OpType,
        payload: serde_json::Value,
    ) -> SyncOp {
        SyncOp {
            id: Uuid::now_v7().to_string(),
            client_id: self.client_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            vector_clock: clock,
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_type: entity,
            entity_id: entity_id.into(),
            op_type,
            action_type: SyncOp::action_label(entity, op_type),
            payload,
        }
    }

    /// Wraps the post-change entity state as an LWW update.
    pub fn lww_update(
        &self,
        store: &dyn OpLogStore,
        entity: EntityKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<SyncOp> {
        let clock = self.next_clock(store)?;
        Ok(self.build(clock, entity, entity_id, OpType::LwwUpdate, payload))
    }

    pub fn create(
        &self,
        store: &dyn OpLogStore,
        entity: EntityKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<SyncOp> {
        let clock = self.next_clock(store)?;
        Ok(self.build(clock, entity, entity_id, OpType::Create, payload))
    }

    pub fn delete(
        &self,
        store: &dyn OpLogStore,
        entity: EntityKind,
        entity_id: impl Into<String>,
    ) -> Result<SyncOp> {
        let clock = self.next_clock(store)?;
        Ok(self.build(
            clock,
            entity,
            entity_id,
            OpType::Delete,
            serde_json::Value::Null,
        ))
    }

    pub fn move_op(
        &self,
        store: &dyn OpLogStore,
        entity: EntityKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<SyncOp> {
        let clock = self.next_clock(store)?;
        Ok(self.build(clock, entity, entity_id, OpType::Move, payload))
    }

    /// Cascade batches and other grouped updates ride a single op.
    pub fn batch(
        &self,
        store: &dyn OpLogStore,
        entity: EntityKind,
        payload: serde_json::Value,
    ) -> Result<SyncOp> {
        let clock = self.next_clock(store)?;
        Ok(self.build(clock, entity, String::new(), OpType::Batch, payload))
    }

    /// Full-state import. The caller supplies the clock: an import's clock
    /// must already include the peer components observed at join time.
    pub fn sync_import(&self, clock: VectorClock, full_state: serde_json::Value) -> SyncOp {
        self.build(
            clock,
            EntityKind::All,
            String::new(),
            OpType::SyncImport,
            full_state,
        )
    }

    pub fn backup_import(&self, clock: VectorClock, full_state: serde_json::Value) -> SyncOp {
        self.build(
            clock,
            EntityKind::All,
            String::new(),
            OpType::BackupImport,
            full_state,
        )
    }
}
