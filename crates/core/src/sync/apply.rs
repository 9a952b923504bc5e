//! Merge resolver: applies remote op batches against local state with
//! entity-level LWW and clock tiebreaks, then runs cross-entity cascades.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::domain::{AppState, LwwMeta};
use crate::errors::{Result, SyncError};
use crate::sync::factory::OpFactory;
use crate::sync::op::{EntityKind, OpType, SyncOp, CURRENT_SCHEMA_VERSION};
use crate::sync::store::OpLogStore;
use crate::sync::vector_clock::ClockOrdering;

/// Outcome of the per-entity LWW step for one op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyVerdict {
    Apply,
    /// Local is strictly newer.
    SkipOlder,
    /// Identical clock, nothing to do.
    SkipEqual,
    /// Concurrent, lost the timestamp/client-id tiebreak.
    SkipTiebreak,
}

impl ApplyVerdict {
    pub fn is_apply(&self) -> bool {
        matches!(self, ApplyVerdict::Apply)
    }
}

/// One skipped op with the reason it was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedOp {
    pub id: String,
    pub reason: String,
}

/// Result of applying a remote batch.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Ids of ops that changed local state.
    pub applied: Vec<String>,
    pub skipped: Vec<SkippedOp>,
    /// Freshly produced local cascade ops (already appended to the log).
    pub cascade_ops: Vec<SyncOp>,
}

impl MergeReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Decide whether a remote op beats the local entity version.
///
/// Dominant clock wins; a Delete additionally beats an equal clock. A
/// concurrent clock falls back to the wall-clock timestamp, then to the
/// lexicographically greater writer id, so every client converges on the
/// same winner.
pub fn decide_lww(op: &SyncOp, local: &LwwMeta) -> ApplyVerdict {
    match op.vector_clock.compare(&local.vector_clock) {
        ClockOrdering::GreaterThan => ApplyVerdict::Apply,
        ClockOrdering::Equal => {
            if op.op_type == OpType::Delete {
                ApplyVerdict::Apply
            } else {
                ApplyVerdict::SkipEqual
            }
        }
        ClockOrdering::LessThan => ApplyVerdict::SkipOlder,
        ClockOrdering::Concurrent => {
            if op.timestamp > local.last_update {
                ApplyVerdict::Apply
            } else if op.timestamp < local.last_update {
                ApplyVerdict::SkipTiebreak
            } else if op.client_id.as_str() > local.last_writer.as_deref().unwrap_or("") {
                ApplyVerdict::Apply
            } else {
                ApplyVerdict::SkipTiebreak
            }
        }
    }
}

/// Payload of a `Move` op for tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    #[serde(default)]
    pub target_project_id: Option<String>,
    #[serde(default)]
    pub today_index: Option<usize>,
}

/// One sub-operation inside a `Batch` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub op_type: OpType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of a `Batch` op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    #[serde(default)]
    pub operations: Vec<BatchEntry>,
}

/// Applies remote ops against local state and produces cascade ops.
pub struct MergeResolver<'a> {
    factory: &'a OpFactory,
    store: &'a dyn OpLogStore,
}

impl<'a> MergeResolver<'a> {
    pub fn new(factory: &'a OpFactory, store: &'a dyn OpLogStore) -> Self {
        Self { factory, store }
    }

    /// Apply a batch of remote ops. Per-entity LWW runs in batch order;
    /// cross-entity cascades run once all entity applies are done.
    pub fn apply_batch(&self, state: &mut AppState, ops: &[SyncOp]) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        let mut accepted_deletes: Vec<(EntityKind, String)> = Vec::new();

        for op in ops {
            if op.schema_version > CURRENT_SCHEMA_VERSION {
                return Err(SyncError::SchemaVersionMismatch {
                    found: op.schema_version,
                    supported: CURRENT_SCHEMA_VERSION,
                });
            }

            if op.is_full_state() {
                let survivors = self.apply_full_state(state, op)?;
                report.applied.push(op.id.clone());
                debug!(
                    "[Merge] full-state {} applied, {} concurrent ops survived",
                    op.id,
                    survivors.len()
                );
                continue;
            }

            match self.apply_user_op(state, op)? {
                ApplyVerdict::Apply => {
                    if op.op_type == OpType::Delete
                        && matches!(op.entity_type, EntityKind::Tag | EntityKind::Project)
                    {
                        accepted_deletes.push((op.entity_type, op.entity_id.clone()));
                    }
                    report.applied.push(op.id.clone());
                }
                verdict => {
                    report.skipped.push(SkippedOp {
                        id: op.id.clone(),
                        reason: format!("{:?}", verdict),
                    });
                }
            }
        }

        for (kind, id) in accepted_deletes {
            let mut cascade = self.run_cascade(state, kind, &id)?;
            report.cascade_ops.append(&mut cascade);
        }

        Ok(report)
    }

    /// Per-entity LWW step for one user op.
    fn apply_user_op(&self, state: &mut AppState, op: &SyncOp) -> Result<ApplyVerdict> {
        let exists = state.entity_exists(op.entity_type, &op.entity_id);

        // Absent entity: anything but a delete recreates it.
        if !exists {
            if op.op_type == OpType::Delete {
                return Ok(ApplyVerdict::SkipEqual);
            }
            self.write_op_into_state(state, op)?;
            return Ok(ApplyVerdict::Apply);
        }

        let verdict = {
            let local = state
                .entity_meta(op.entity_type, &op.entity_id)
                .expect("entity checked above");
            decide_lww(op, local)
        };
        if verdict.is_apply() {
            self.write_op_into_state(state, op)?;
        } else {
            // A losing concurrent op still contributes its clock so that
            // winners and losers end up with identical metadata.
            state.merge_entity_clock(op.entity_type, &op.entity_id, &op.vector_clock);
        }
        Ok(verdict)
    }

    fn write_op_into_state(&self, state: &mut AppState, op: &SyncOp) -> Result<()> {
        match op.op_type {
            OpType::Delete => {
                state.remove_entity(op.entity_type, &op.entity_id);
            }
            OpType::Move => {
                let payload: MovePayload = serde_json::from_value(op.payload.clone())?;
                state.move_task(
                    &op.entity_id,
                    payload.target_project_id.as_deref(),
                    payload.today_index,
                );
                if let Some(task) = state.tasks.get_mut(&op.entity_id) {
                    task.meta.vector_clock.merge(&op.vector_clock);
                    task.meta.last_update = op.timestamp;
                    task.meta.last_writer = Some(op.client_id.clone());
                }
            }
            OpType::Batch => {
                let payload: BatchPayload = serde_json::from_value(op.payload.clone())?;
                for entry in payload.operations {
                    if entry.op_type == OpType::Delete {
                        state.remove_entity(entry.entity_type, &entry.entity_id);
                    } else {
                        let mut clock = op.vector_clock.clone();
                        if let Some(meta) = state.entity_meta(entry.entity_type, &entry.entity_id)
                        {
                            clock.merge(&meta.vector_clock);
                        }
                        state.upsert_entity(
                            entry.entity_type,
                            &entry.entity_id,
                            &entry.payload,
                            &clock,
                            op.timestamp,
                            &op.client_id,
                        )?;
                    }
                }
            }
            OpType::Create | OpType::Update | OpType::LwwUpdate => {
                let mut clock = op.vector_clock.clone();
                if let Some(meta) = state.entity_meta(op.entity_type, &op.entity_id) {
                    clock.merge(&meta.vector_clock);
                }
                state.upsert_entity(
                    op.entity_type,
                    &op.entity_id,
                    &op.payload,
                    &clock,
                    op.timestamp,
                    &op.client_id,
                )?;
            }
            OpType::SyncImport | OpType::BackupImport | OpType::Repair => {
                return Err(SyncError::storage(
                    "full-state ops must go through apply_full_state",
                ));
            }
        }
        Ok(())
    }

    /// Tag/project deletion scrubs references from every live and archived
    /// task. Each touched live task yields a fresh local LWW op so peers
    /// converge even when they see the delete before the cleanup.
    fn run_cascade(
        &self,
        state: &mut AppState,
        kind: EntityKind,
        deleted_id: &str,
    ) -> Result<Vec<SyncOp>> {
        let affected = match kind {
            EntityKind::Tag => state.scrub_tag_references(deleted_id),
            EntityKind::Project => state.scrub_project_references(deleted_id),
            _ => return Ok(Vec::new()),
        };

        let mut cascade_ops = Vec::new();
        for task_id in affected {
            let Some(task) = state.tasks.get(&task_id) else {
                // Archived tasks were scrubbed in place; peers repeat the
                // same scrub when they apply the delete.
                continue;
            };
            let payload = serde_json::to_value(task)?;
            let op = self
                .factory
                .lww_update(self.store, EntityKind::Task, &task_id, payload)?;
            self.store.append(&op)?;
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.meta.vector_clock = op.vector_clock.clone();
                task.meta.last_update = op.timestamp;
                task.meta.last_writer = Some(op.client_id.clone());
            }
            cascade_ops.push(op);
        }

        if !cascade_ops.is_empty() {
            debug!(
                "[Merge] cascade for {} {} touched {} tasks",
                kind.label(),
                deleted_id,
                cascade_ops.len()
            );
        }
        Ok(cascade_ops)
    }

    /// Apply a full-state op without erasing concurrent peer edits: the
    /// imported state replaces local state, then every logged op that is
    /// concurrent with (or later than) the import clock is replayed on top.
    /// Ops strictly dominated by the import clock stay dropped.
    pub fn apply_full_state(&self, state: &mut AppState, import: &SyncOp) -> Result<Vec<SyncOp>> {
        let payload = import
            .full_state_payload()
            .ok_or_else(|| SyncError::storage("full-state op without payload"))?;
        let imported: AppState = serde_json::from_value(payload.clone())?;

        let mut candidates = self.store.get_recent(crate::sync::store::RECENT_OPS_CAP)?;
        let unsynced = self.store.get_unsynced()?;
        for op in unsynced {
            if !candidates.iter().any(|c| c.id == op.id) {
                candidates.push(op);
            }
        }

        let survivors: Vec<SyncOp> = candidates
            .into_iter()
            .filter(|op| {
                op.id != import.id
                    && op.is_user_op()
                    && matches!(
                        op.vector_clock.compare(&import.vector_clock),
                        ClockOrdering::Concurrent | ClockOrdering::GreaterThan
                    )
            })
            .collect();

        *state = imported;
        for op in &survivors {
            self.apply_user_op(state, op)?;
        }
        Ok(survivors)
    }
}
