//! The operation model: the atomic unit of change in the sync log.

use serde::{Deserialize, Serialize};

use crate::sync::vector_clock::VectorClock;

/// Payload schema version stamped on every locally produced op.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Entity variants that participate in sync. `All` tags full-state ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Task,
    Project,
    Tag,
    Note,
    SimpleCounter,
    Metric,
    RepeatCfg,
    IssueProvider,
    Reminder,
    All,
}

impl EntityKind {
    /// Display tag used in `action_type` labels.
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Task => "TASK",
            EntityKind::Project => "PROJECT",
            EntityKind::Tag => "TAG",
            EntityKind::Note => "NOTE",
            EntityKind::SimpleCounter => "SIMPLE_COUNTER",
            EntityKind::Metric => "METRIC",
            EntityKind::RepeatCfg => "REPEAT_CFG",
            EntityKind::IssueProvider => "ISSUE_PROVIDER",
            EntityKind::Reminder => "REMINDER",
            EntityKind::All => "ALL",
        }
    }
}

/// Supported operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    Create,
    Update,
    Delete,
    Move,
    Batch,
    #[serde(rename = "LWWUpdate")]
    LwwUpdate,
    SyncImport,
    BackupImport,
    Repair,
}

impl OpType {
    /// Full-state ops carry the entire application state in their payload.
    pub fn is_full_state(&self) -> bool {
        matches!(
            self,
            OpType::SyncImport | OpType::BackupImport | OpType::Repair
        )
    }

    /// Verb used in `action_type` labels.
    pub fn label(&self) -> &'static str {
        match self {
            OpType::Create => "Create",
            OpType::Update => "Update",
            OpType::Delete => "Delete",
            OpType::Move => "Move",
            OpType::Batch => "Batch",
            OpType::LwwUpdate => "LWW Update",
            OpType::SyncImport => "Sync Import",
            OpType::BackupImport => "Backup Import",
            OpType::Repair => "Repair",
        }
    }
}

/// A single immutable change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOp {
    /// Globally unique, time-sortable id (UUIDv7).
    pub id: String,
    /// Stable per-install identifier, also a vector clock key.
    pub client_id: String,
    /// Client wall-clock at creation (epoch ms). LWW tiebreaker only.
    pub timestamp: i64,
    pub vector_clock: VectorClock,
    pub schema_version: u32,
    pub entity_type: EntityKind,
    /// Ignored for full-state ops.
    #[serde(default)]
    pub entity_id: String,
    pub op_type: OpType,
    /// Display/debug string such as `"[TASK] LWW Update"`.
    pub action_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SyncOp {
    /// True iff `op_type` is one of the full-state variants.
    pub fn is_full_state(&self) -> bool {
        self.op_type.is_full_state()
    }

    /// True for everything that is not a full-state op.
    pub fn is_user_op(&self) -> bool {
        !self.is_full_state()
    }

    /// Full-state payload, accepting both the unwrapped form and the form
    /// wrapped in a single `appDataComplete` key.
    pub fn full_state_payload(&self) -> Option<&serde_json::Value> {
        if !self.is_full_state() {
            return None;
        }
        if let Some(obj) = self.payload.as_object() {
            if obj.len() == 1 {
                if let Some(wrapped) = obj.get("appDataComplete") {
                    return Some(wrapped);
                }
            }
        }
        Some(&self.payload)
    }

    /// Action label for an `(entity, op)` pair, e.g. `"[TASK] LWW Update"`.
    pub fn action_label(entity: EntityKind, op: OpType) -> String {
        format!("[{}] {}", entity.label(), op.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_serialization_matches_wire_contract() {
        let actual = [
            EntityKind::Task,
            EntityKind::Project,
            EntityKind::Tag,
            EntityKind::Note,
            EntityKind::SimpleCounter,
            EntityKind::Metric,
            EntityKind::RepeatCfg,
            EntityKind::IssueProvider,
            EntityKind::Reminder,
            EntityKind::All,
        ]
        .iter()
        .map(|kind| serde_json::to_string(kind).expect("serialize entity kind"))
        .collect::<Vec<_>>();

        let expected = vec![
            "\"TASK\"",
            "\"PROJECT\"",
            "\"TAG\"",
            "\"NOTE\"",
            "\"SIMPLE_COUNTER\"",
            "\"METRIC\"",
            "\"REPEAT_CFG\"",
            "\"ISSUE_PROVIDER\"",
            "\"REMINDER\"",
            "\"ALL\"",
        ];

        assert_eq!(actual, expected);
    }

    #[test]
    fn op_type_serialization_keeps_lww_spelling() {
        assert_eq!(
            serde_json::to_string(&OpType::LwwUpdate).expect("serialize"),
            "\"LWWUpdate\""
        );
        let parsed: OpType = serde_json::from_str("\"LWWUpdate\"").expect("parse");
        assert_eq!(parsed, OpType::LwwUpdate);
    }

    #[test]
    fn full_state_payload_unwraps_app_data_complete() {
        let op = SyncOp {
            id: "0".to_string(),
            client_id: "a".to_string(),
            timestamp: 0,
            vector_clock: VectorClock::new(),
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_type: EntityKind::All,
            entity_id: String::new(),
            op_type: OpType::SyncImport,
            action_type: SyncOp::action_label(EntityKind::All, OpType::SyncImport),
            payload: serde_json::json!({ "appDataComplete": { "tasks": {} } }),
        };
        assert_eq!(
            op.full_state_payload(),
            Some(&serde_json::json!({ "tasks": {} }))
        );
    }

    #[test]
    fn op_json_is_camel_case() {
        let op = SyncOp {
            id: "0".to_string(),
            client_id: "a".to_string(),
            timestamp: 1,
            vector_clock: VectorClock::new(),
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_type: EntityKind::Task,
            entity_id: "t1".to_string(),
            op_type: OpType::LwwUpdate,
            action_type: SyncOp::action_label(EntityKind::Task, OpType::LwwUpdate),
            payload: serde_json::Value::Null,
        };
        let json = serde_json::to_value(&op).expect("serialize op");
        assert_eq!(json["entityType"], "TASK");
        assert_eq!(json["opType"], "LWWUpdate");
        assert_eq!(json["actionType"], "[TASK] LWW Update");
        assert!(json.get("vectorClock").is_some());
        assert!(json.get("schemaVersion").is_some());
    }
}
