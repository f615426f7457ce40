use std::str::FromStr;

use oplog_proto::{OpId, OpType, Operation, VectorClock};
use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    // if LOG_LEVEL env var is set, use it
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::fmt().with_max_level(Level::from_str(&level).unwrap()).with_test_writer().init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init();
    }
}

#[allow(unused)]
pub fn task_op(client: &str, id: &str, counter: u64) -> Operation {
    Operation {
        id: OpId::new(),
        client_id: client.into(),
        action_type: "[Task] Create".into(),
        op_type: OpType::Create,
        entity_type: "TASK".into(),
        entity_id: Some(id.into()),
        entity_ids: None,
        payload: serde_json::json!({ "id": id }),
        vector_clock: VectorClock::from([(client, counter)]),
        timestamp: 1_000,
        schema_version: 1,
    }
}
