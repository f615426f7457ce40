use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{clock::VectorClock, entity::EntityKey, operation::Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    Local,
    Remote,
}

impl std::fmt::Display for OpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpSource::Local => write!(f, "local"),
            OpSource::Remote => write!(f, "remote"),
        }
    }
}

/// Persisted envelope around an [`Operation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    /// Local, strictly increasing sequence number
    pub seq: u64,
    pub op: Operation,
    /// Set once the op is reflected in local state. Zero while `pending_apply` is set.
    pub applied_at: i64,
    pub source: OpSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_apply: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failed_attempts: u32,
}

fn is_zero(n: &u32) -> bool { *n == 0 }

impl OperationLogEntry {
    pub fn is_synced(&self) -> bool { self.synced_at.is_some() }

    pub fn is_rejected(&self) -> bool { self.rejected_at.is_some() }

    /// Local op still waiting for server acceptance
    pub fn is_unsynced_local(&self) -> bool { self.source == OpSource::Local && self.synced_at.is_none() && self.rejected_at.is_none() }

    /// Reflected in local state and not superseded
    pub fn is_applied(&self) -> bool { !self.pending_apply && self.rejected_at.is_none() }
}

/// Full-state snapshot written by compaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCache {
    pub state: serde_json::Value,
    pub last_applied_op_seq: u64,
    pub vector_clock: VectorClock,
    pub compacted_at: i64,
    #[serde(default = "crate::operation::default_schema_version")]
    pub schema_version: u32,
    /// Every entity present when the snapshot was taken. `None` for snapshots written before this was tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_entity_keys: Option<BTreeSet<EntityKey>>,
}

impl StateCache {
    pub fn contains_entity(&self, key: &EntityKey) -> Option<bool> { self.snapshot_entity_keys.as_ref().map(|keys| keys.contains(key)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn old_snapshot_without_entity_keys_still_loads() {
        let value = json!({
            "state": {},
            "lastAppliedOpSeq": 12,
            "vectorClock": {"a": 4},
            "compactedAt": 99
        });
        let cache: StateCache = serde_json::from_value(value).unwrap();
        assert_eq!(cache.snapshot_entity_keys, None);
        assert_eq!(cache.schema_version, 1);
        assert_eq!(cache.contains_entity(&EntityKey::new("TASK", "t1")), None);
    }
}
