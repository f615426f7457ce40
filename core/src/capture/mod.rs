//! Turning local state mutations into queued entity changes.
//!
//! Capture sits between the application's mutation path and the [`OperationWriter`]: each
//! [`Intent`] together with the before and after states becomes one [`CaptureItem`] on the
//! bounded [`CaptureQueue`].

mod diff;
mod queue;
mod writer;

pub use diff::{deep_equal, diff_states, DiffOptions};
pub use queue::CaptureQueue;
pub use writer::{flush_pending_writes, OperationWriter};

use std::sync::Arc;

use oplog_proto::{now_ms, OpType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{config::CaptureConfig, state::AppState};

/// One entity-level change. `changes` is the full value for Create, a sparse diff for Update and
/// `{id}` for Delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub entity_type: String,
    pub entity_id: String,
    pub op_type: OpType,
    pub changes: Value,
}

impl EntityChange {
    pub fn new(entity_type: &str, entity_id: &str, op_type: OpType, changes: Value) -> Self {
        Self { entity_type: entity_type.to_string(), entity_id: entity_id.to_string(), op_type, changes }
    }
}

/// What caused a mutation
#[derive(Debug, Clone)]
pub struct Intent {
    pub action_type: String,
    pub payload: IntentPayload,
}

#[derive(Debug, Clone)]
pub enum IntentPayload {
    /// Derive changes by diffing the before and after states
    Diff,
    /// High-frequency updates that already know their change; skips diffing entirely
    Direct(Vec<EntityChange>),
}

impl Intent {
    pub fn diff(action_type: impl Into<String>) -> Self { Self { action_type: action_type.into(), payload: IntentPayload::Diff } }

    pub fn direct(action_type: impl Into<String>, changes: Vec<EntityChange>) -> Self {
        Self { action_type: action_type.into(), payload: IntentPayload::Direct(changes) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureItem {
    pub action_type: String,
    pub changes: Vec<EntityChange>,
    pub captured_at: i64,
}

#[derive(Clone)]
pub struct OperationCapture {
    queue: Arc<CaptureQueue>,
    options: DiffOptions,
}

impl OperationCapture {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            queue: Arc::new(CaptureQueue::new(config.queue_capacity, config.low_water_mark)),
            options: DiffOptions { max_depth: config.max_diff_depth },
        }
    }

    pub fn queue(&self) -> &Arc<CaptureQueue> { &self.queue }

    /// Compute and enqueue the changes caused by `intent`. Returns how many were enqueued.
    pub fn capture(&self, intent: Intent, before: &AppState, after: &AppState) -> usize {
        let changes = match intent.payload {
            IntentPayload::Direct(changes) => changes,
            IntentPayload::Diff => diff_states(before, after, &self.options),
        };
        if changes.is_empty() {
            return 0;
        }
        let count = changes.len();
        debug!("captured {} change(s) for {}", count, intent.action_type);
        self.queue.push(CaptureItem { action_type: intent.action_type, changes, captured_at: now_ms() });
        count
    }
}
