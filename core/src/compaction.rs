//! Snapshotting and log garbage collection.
//!
//! Correctness hinges on one ordering: `last_seq` is read immediately before the new snapshot
//! is written, inside the write lock. Anything appended afterwards has a larger seq and is never
//! eligible for deletion by this run.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use oplog_proto::{now_ms, EntityKey, OperationLogEntry, StateCache};
use tokio::time::Instant;

use crate::{
    action_info, action_warn,
    clock_tracker::VectorClockTracker,
    config::CompactionConfig,
    error::CompactionError,
    state::StateStore,
    store::OpLogStore,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub deleted: usize,
    pub last_seq: u64,
    pub entity_keys: usize,
}

/// An entry may be dropped once the server has it, it has been applied locally, it is older than
/// the retention window, and the snapshot written by this run already reflects it.
///
/// Pending remote ops carry `applied_at == 0`, so the pending check must come first.
pub fn is_compactable(entry: &OperationLogEntry, cutoff_ms: i64, last_seq: u64) -> bool {
    !entry.pending_apply && entry.synced_at.is_some() && entry.applied_at < cutoff_ms && entry.seq <= last_seq
}

#[derive(Clone)]
pub struct Compactor {
    store: OpLogStore,
    state: Arc<dyn StateStore>,
    tracker: VectorClockTracker,
    config: CompactionConfig,
    schema_version: u32,
}

impl Compactor {
    pub fn new(store: OpLogStore, state: Arc<dyn StateStore>, config: CompactionConfig, schema_version: u32) -> Self {
        Self { tracker: VectorClockTracker::new(store.clone()), store, state, config, schema_version }
    }

    pub async fn compact(&self) -> Result<CompactionReport, CompactionError> { self.compact_with_retention(self.config.retention).await }

    pub async fn compact_with_retention(&self, retention: Duration) -> Result<CompactionReport, CompactionError> {
        let writer = self.store.writer().await?;
        let budget = Budget::new(self.config.phase_timeout);

        let state = budget.run("snapshot_state", async { self.state.full_state().await.map_err(CompactionError::from) }).await?;
        let vector_clock = budget.run("read_clock", async { self.tracker.current_vector_clock().await.map_err(CompactionError::from) }).await?;
        // must stay the last read before the snapshot write
        let last_seq = budget.run("read_last_seq", async { writer.get_last_seq().await.map_err(CompactionError::from) }).await?;

        let entity_keys: BTreeSet<EntityKey> = state.entity_keys();
        let entity_key_count = entity_keys.len();
        let cache = StateCache {
            state: state.to_value().map_err(crate::error::StorageError::from)?,
            last_applied_op_seq: last_seq,
            vector_clock,
            compacted_at: now_ms(),
            schema_version: self.schema_version,
            snapshot_entity_keys: Some(entity_keys),
        };
        budget.run("save_snapshot", async { writer.save_state_cache(cache).await.map_err(CompactionError::from) }).await?;
        budget.run("reset_counter", async { writer.reset_compaction_counter().await.map_err(CompactionError::from) }).await?;

        let cutoff = now_ms() - retention.as_millis() as i64;
        let deleted =
            budget.run("delete_ops", async { writer.delete_ops_where(|e| is_compactable(e, cutoff, last_seq)).await.map_err(CompactionError::from) }).await?;

        action_info!("Compactor", "compacted", "snapshot at seq {}, {} entities, {} ops deleted", last_seq, entity_key_count, deleted);
        Ok(CompactionReport { deleted, last_seq, entity_keys: entity_key_count })
    }

    /// Compaction with the short retention window, for storage quota pressure. Never fails;
    /// returns whether it succeeded.
    pub async fn emergency_compact(&self) -> bool {
        match self.compact_with_retention(self.config.emergency_retention).await {
            Ok(report) => {
                action_info!("Compactor", "emergency compaction", "{} ops deleted", report.deleted);
                true
            }
            Err(e) => {
                action_warn!("Compactor", "emergency compaction failed", "{}", e);
                false
            }
        }
    }
}

/// Shared time budget for all compaction phases
struct Budget {
    deadline: Instant,
}

impl Budget {
    fn new(total: Duration) -> Self { Self { deadline: Instant::now() + total } }

    async fn run<T>(&self, phase: &'static str, fut: impl Future<Output = Result<T, CompactionError>>) -> Result<T, CompactionError> {
        if Instant::now() >= self.deadline {
            return Err(CompactionError::Timeout { phase });
        }
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(CompactionError::Timeout { phase }),
        }
    }
}
