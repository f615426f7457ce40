//! Builders shared by unit tests.

use oplog_proto::{OpId, OpType, Operation, VectorClock};
use serde_json::json;

pub fn op<const N: usize>(client: &str, op_type: OpType, entity_type: &str, entity_id: &str, clock: [(&str, u64); N]) -> Operation {
    op_at(client, op_type, entity_type, entity_id, clock, 1_000)
}

pub fn op_at<const N: usize>(
    client: &str,
    op_type: OpType,
    entity_type: &str,
    entity_id: &str,
    clock: [(&str, u64); N],
    timestamp: i64,
) -> Operation {
    let payload = match op_type {
        OpType::Delete => json!({ "id": entity_id }),
        _ => json!({ "id": entity_id, "title": format!("{client}@{timestamp}") }),
    };
    Operation {
        id: OpId::new(),
        client_id: client.into(),
        action_type: format!("[{entity_type}] {op_type}"),
        op_type,
        entity_type: entity_type.to_string(),
        entity_id: Some(entity_id.to_string()),
        entity_ids: None,
        payload,
        vector_clock: VectorClock::from(clock),
        timestamp,
        schema_version: 1,
    }
}
