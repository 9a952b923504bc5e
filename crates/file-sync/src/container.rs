//! The shared `sync-data.json` container format.

use serde::{Deserialize, Serialize};

use daystack_core::errors::Result;
use daystack_core::sync::{PayloadProtector, SyncOp, VectorClock, RECENT_OPS_CAP};

/// File name of the single-file container inside the sync folder.
pub const SYNC_DATA_FILE: &str = "sync-data.json";

/// Single shared container: summary state plus a bounded recent-ops buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncContainer {
    /// Logical write counter; the authoritative conflict signal when the
    /// store cannot enforce conditional writes.
    pub sync_version: u64,
    /// Merged clock over every op the container has ever carried.
    pub vector_clock: VectorClock,
    /// Client that produced this revision.
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_state: Option<serde_json::Value>,
    /// Clock the snapshot was taken at; bootstrap imports use it so newer
    /// recent ops still apply on top.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_clock: Option<VectorClock>,
    #[serde(default)]
    pub recent_ops: Vec<SyncOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_young: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_old: Option<serde_json::Value>,
}

impl SyncContainer {
    /// Merge ops into the recent buffer: dedup by id, keep natural id
    /// order (UUIDv7, approximates creation order), cap at the newest
    /// `RECENT_OPS_CAP`.
    pub fn merge_recent_ops<'a>(&mut self, ops: impl IntoIterator<Item = &'a SyncOp>) {
        for op in ops {
            if !self.recent_ops.iter().any(|existing| existing.id == op.id) {
                self.recent_ops.push(op.clone());
            }
            self.vector_clock.merge(&op.vector_clock);
        }
        self.recent_ops.sort_by(|a, b| a.id.cmp(&b.id));
        if self.recent_ops.len() > RECENT_OPS_CAP {
            let excess = self.recent_ops.len() - RECENT_OPS_CAP;
            self.recent_ops.drain(..excess);
        }
    }

    /// Serialize and protect for upload.
    pub fn encode(&self, protector: &PayloadProtector) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        protector.seal(&json)
    }

    /// Open and parse a downloaded container.
    pub fn decode(data: &[u8], protector: &PayloadProtector) -> Result<Self> {
        let opened = protector.open(data)?;
        Ok(serde_json::from_slice(&opened)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daystack_core::sync::{EntityKind, EnvelopeConfig, OpType, CURRENT_SCHEMA_VERSION};

    fn op(id: &str, client: &str, component: u64) -> SyncOp {
        SyncOp {
            id: id.to_string(),
            client_id: client.to_string(),
            timestamp: 0,
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
    fn merge_recent_ops_dedups_and_caps() {
        let mut container = SyncContainer::default();
        let ops: Vec<SyncOp> = (0..(RECENT_OPS_CAP + 10))
            .map(|i| op(&format!("{:08}", i), "a", i as u64 + 1))
            .collect();
        container.merge_recent_ops(&ops);
        container.merge_recent_ops(&ops); // duplicates are no-ops

        assert_eq!(container.recent_ops.len(), RECENT_OPS_CAP);
        // The oldest overflowed out, the newest survived.
        assert_eq!(container.recent_ops.first().expect("first").id, "00000010");
        assert_eq!(
            container.vector_clock.get("a"),
            (RECENT_OPS_CAP + 10) as u64
        );
    }

    #[test]
    fn container_json_is_camel_case() {
        let container = SyncContainer {
            sync_version: 3,
            client_id: "c1".to_string(),
            ..SyncContainer::default()
        };
        let json = serde_json::to_value(&container).expect("serialize");
        assert_eq!(json["syncVersion"], 3);
        assert_eq!(json["clientId"], "c1");
        assert!(json.get("recentOps").is_some());
        assert!(json.get("snapshotState").is_none());
    }

    #[test]
    fn encode_decode_round_trips_with_compression() {
        let protector = PayloadProtector::new(
            EnvelopeConfig {
                is_encryption_enabled: false,
                is_compression_enabled: true,
            },
            "salt",
        );
        let mut container = SyncContainer {
            sync_version: 1,
            client_id: "c1".to_string(),
            ..SyncContainer::default()
        };
        container.merge_recent_ops(&[op("op-1", "a", 1)]);

        let encoded = container.encode(&protector).expect("encode");
        let decoded = SyncContainer::decode(&encoded, &protector).expect("decode");
        assert_eq!(decoded, container);
    }
}
