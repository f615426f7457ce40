mod app_state;
mod memory;

pub use app_state::{AppState, EntitySlice, Slice};
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use oplog_proto::Operation;
use serde_json::Value;

use crate::error::StateError;

/// Action type of ops created by LWW conflict resolution. Their payload is the full entity,
/// applied as an upsert.
pub const LWW_UPDATE_ACTION: &str = "[OpLog] LWW Update";

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Ops applied, in order
    pub applied: Vec<Operation>,
    /// First op that failed. Nothing after it in the batch was applied.
    pub failed: Option<(Operation, StateError)>,
}

/// The application state the log describes. Feature reducers live behind this seam.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn full_state(&self) -> Result<AppState, StateError>;

    /// Apply `ops` in order, stopping at the first failure
    async fn apply_operations(&self, ops: &[Operation]) -> ApplyOutcome;

    async fn entity_state(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>, StateError>;

    /// Replace the whole state, e.g. from a snapshot during hydration
    async fn load_state(&self, state: AppState) -> Result<(), StateError>;
}
