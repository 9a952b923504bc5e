//! Wire types for the op-sync server protocol.

use daystack_core::sync::{RejectedOp, SyncOp, VectorClock};
use serde::{Deserialize, Serialize};

/// An op whose serialized form has been sealed by the payload envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedOp {
    /// Base64 of the envelope bytes.
    pub encrypted_data: String,
}

/// Ops travel either sealed or plain, depending on the envelope config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireOp {
    Encrypted(EncryptedOp),
    Plain(SyncOp),
}

/// `GET /api/sync/ops?sinceSeq=N` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsPullResponse {
    pub ops: Vec<WireOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_state: Option<serde_json::Value>,
    /// Clock of the snapshot; includes this client's own component when it
    /// synced before, so post-bootstrap ops stay causally later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_clock: Option<VectorClock>,
    pub server_seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_migration: Option<bool>,
}

/// `POST /api/sync/ops` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsPushRequest {
    pub ops: Vec<WireOp>,
    pub vector_clock_at_upload: VectorClock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_clean_slate: Option<bool>,
}

/// `POST /api/sync/ops` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsPushResponse {
    pub accepted: bool,
    pub server_seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_ops: Option<Vec<RejectedOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piggybacked_ops: Option<Vec<WireOp>>,
}

/// `POST /api/sync/snapshot` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUploadRequest {
    pub snapshot: WireOp,
    pub vector_clock: VectorClock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_clean_slate: Option<bool>,
}

/// `POST /api/sync/snapshot` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUploadResponse {
    pub server_seq: i64,
}

/// Generic success acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub success: bool,
}

/// One admin restore point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePoint {
    pub server_seq: i64,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Error body returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub error: String,
    pub code: String,
    pub message: String,
}
