use serde::{Deserialize, Serialize};

use crate::{
    clock::VectorClock,
    id::{ClientId, OpId},
    operation::{OpType, Operation, ALL_ENTITY_TYPE},
};

/// Server-side reason for refusing an uploaded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    StorageQuotaExceeded,
    InternalError,
    ConflictConcurrent,
    ConflictStale,
    ValidationError,
    /// Any code this client does not know about; treated as permanent
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpUploadResult {
    pub op_id: OpId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<RejectionCode>,
}

impl OpUploadResult {
    pub fn accepted(op_id: OpId, server_seq: u64) -> Self { Self { op_id, accepted: true, server_seq: Some(server_seq), error: None, error_code: None } }

    pub fn rejected(op_id: OpId, code: RejectionCode, error: impl Into<String>) -> Self {
        Self { op_id, accepted: false, server_seq: None, error: Some(error.into()), error_code: Some(code) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub ops: Vec<Operation>,
    pub client_id: ClientId,
    pub last_known_server_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub results: Vec<OpUploadResult>,
    /// Ops from other clients the uploader has not seen yet
    #[serde(default)]
    pub piggybacked_ops: Vec<Operation>,
    pub latest_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub since_seq: u64,
    /// Leave out the requesting client's own ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_client_id: Option<ClientId>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOperation {
    pub server_seq: u64,
    pub op: Operation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub ops: Vec<ServerOperation>,
    pub has_more: bool,
    pub latest_seq: u64,
    /// The requested `since_seq` lies beyond the server's history (e.g. the server was reset)
    #[serde(default)]
    pub gap_detected: bool,
    /// Clock of the server's latest full-state snapshot, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_vector_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotReason {
    Initial,
    Migration,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUpload {
    pub op_id: OpId,
    pub state: serde_json::Value,
    pub client_id: ClientId,
    pub reason: SnapshotReason,
    pub vector_clock: VectorClock,
    pub schema_version: u32,
    pub action_type: String,
    pub op_type: OpType,
    pub timestamp: i64,
}

impl SnapshotUpload {
    /// Wrap a full-state operation for upload
    pub fn from_operation(op: Operation, reason: SnapshotReason) -> Self {
        Self {
            op_id: op.id,
            state: op.payload,
            client_id: op.client_id,
            reason,
            vector_clock: op.vector_clock,
            schema_version: op.schema_version,
            action_type: op.action_type,
            op_type: op.op_type,
            timestamp: op.timestamp,
        }
    }

    /// The full-state operation this snapshot stands for, as other clients will download it
    pub fn into_operation(self) -> Operation {
        Operation {
            id: self.op_id,
            client_id: self.client_id,
            action_type: self.action_type,
            op_type: self.op_type,
            entity_type: ALL_ENTITY_TYPE.to_string(),
            entity_id: None,
            entity_ids: None,
            payload: self.state,
            vector_clock: self.vector_clock,
            timestamp: self.timestamp,
            schema_version: self.schema_version,
        }
    }
}
