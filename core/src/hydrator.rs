use std::sync::Arc;

use oplog_proto::{Operation, OperationLogEntry};
use tracing::{debug, info, warn};

use crate::{
    action_info,
    applier::OperationApplier,
    error::{OpLogError, StorageError},
    migration::SchemaMigrator,
    state::{AppState, StateStore},
    store::OpLogStore,
    validation::ValidationContext,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationReport {
    pub snapshot_loaded: bool,
    /// Schema version the snapshot was upgraded from
    pub migrated_from: Option<u32>,
    /// Tail ops applied on top of the snapshot
    pub replayed: usize,
    /// Remote ops left pending by an interrupted apply and applied now
    pub recovered: usize,
}

/// Rebuilds application state at startup from the compacted snapshot plus the log tail.
pub struct Hydrator {
    store: OpLogStore,
    state: Arc<dyn StateStore>,
    migrator: SchemaMigrator,
    applier: OperationApplier,
}

impl Hydrator {
    pub fn new(store: OpLogStore, state: Arc<dyn StateStore>, migrator: SchemaMigrator, applier: OperationApplier) -> Self {
        Self { store, state, migrator, applier }
    }

    pub async fn hydrate(&self) -> Result<HydrationReport, OpLogError> {
        let writer = self.store.writer().await?;
        let mut report = HydrationReport::default();

        let cache = writer.load_state_cache().await?;
        let after_seq = cache.as_ref().map(|c| c.last_applied_op_seq).unwrap_or(0);
        if let Some(cache) = cache {
            let state = self.upgrade_state(cache.state, cache.schema_version)?;
            self.state.load_state(state).await?;
            report.snapshot_loaded = true;
            if cache.schema_version < self.migrator.current_version() {
                report.migrated_from = Some(cache.schema_version);
                self.applier.repairer().validate_and_repair(&writer, ValidationContext::Hydration).await?;
            }
        }

        report.replayed = self.replay_tail(after_seq).await?;

        // pending remote ops are not part of the replay; they get their own retry accounting
        report.recovered = match self.applier.recover_pending_remote_ops(&writer).await {
            Ok(n) => n,
            Err(OpLogError::PartialApply { applied, failed_op, cause, .. }) => {
                warn!("recovery of pending remote ops stopped at {:#}: {}", failed_op, cause);
                applied
            }
            Err(e) => return Err(e),
        };

        action_info!("Hydrator", "hydrated", "{:?}", report);
        Ok(report)
    }

    /// Replay applied entries after the snapshot. A full-state op in the tail replaces everything
    /// before it, so only the last one and what follows are needed.
    async fn replay_tail(&self, after_seq: u64) -> Result<usize, OpLogError> {
        let tail: Vec<OperationLogEntry> = self.store.get_ops_after_seq(after_seq).await?.into_iter().filter(|e| e.is_applied()).collect();
        let start = tail.iter().rposition(|e| e.op.is_full_state()).unwrap_or(0);

        let mut ops: Vec<Operation> = Vec::with_capacity(tail.len() - start);
        for entry in tail.into_iter().skip(start) {
            match self.migrator.migrate_operation(entry.op)? {
                Some(op) => ops.push(op),
                None => debug!("seq {} dropped by schema migration during replay", entry.seq),
            }
        }

        let mut loaded = 0;
        if let Some(import) = ops.first().filter(|op| op.is_full_state()) {
            info!("tail starts at full-state {} {:#}; loading it directly", import.op_type, import.id);
            let state = self.upgrade_state(import.payload.clone(), import.schema_version)?;
            self.state.load_state(state).await?;
            ops.remove(0);
            loaded = 1;
        }
        if ops.is_empty() {
            return Ok(loaded);
        }

        let count = ops.len();
        let outcome = self.state.apply_operations(&ops).await;
        if let Some((op, cause)) = outcome.failed {
            // the log is the source of truth; an entry that no longer applies is skipped, not fatal
            warn!("replay of {:#} failed: {}; {} of {} tail op(s) applied", op.id, cause, outcome.applied.len(), count);
            return Ok(loaded + outcome.applied.len());
        }
        Ok(loaded + count)
    }

    fn upgrade_state(&self, value: serde_json::Value, from_version: u32) -> Result<AppState, OpLogError> {
        let value = self.migrator.migrate_state(value, from_version)?;
        Ok(AppState::from_value(value).map_err(StorageError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock_tracker::VectorClockTracker,
        config::SchemaConfig,
        lock::InProcessLock,
        migration::SchemaMigration,
        state::MemoryStateStore,
        storage::MemoryOpLogStorage,
        store::AppendOptions,
        testing::op,
        validation::{AlwaysValid, Repairer},
    };
    use oplog_proto::{OpSource, OpType, StateCache, VectorClock};
    use serde_json::{json, Value};

    fn hydrator(store: &OpLogStore, state: Arc<MemoryStateStore>, migrator: SchemaMigrator) -> Hydrator {
        let repairer = Repairer::new(state.clone(), Arc::new(AlwaysValid), VectorClockTracker::new(store.clone()), "A".into(), migrator.current_version());
        let applier = OperationApplier::new(state.clone(), repairer);
        Hydrator::new(store.clone(), state, migrator, applier)
    }

    fn store() -> OpLogStore { OpLogStore::new(Arc::new(MemoryOpLogStorage::new()), Arc::new(InProcessLock::new())) }

    fn tasks(ids: &[&str]) -> AppState {
        AppState::new().with_entities("TASK", ids.iter().map(|id| (*id, json!({"id": id}))).collect())
    }

    #[tokio::test]
    async fn snapshot_plus_tail() -> anyhow::Result<()> {
        let store = store();
        let writer = store.writer().await?;
        writer.append(op("A", OpType::Create, "TASK", "old", [("A", 1)]), OpSource::Local, AppendOptions::default()).await?;
        writer
            .save_state_cache(StateCache {
                state: tasks(&["old"]).to_value()?,
                last_applied_op_seq: 1,
                vector_clock: VectorClock::from([("A", 1)]),
                compacted_at: 0,
                schema_version: 1,
                snapshot_entity_keys: None,
            })
            .await?;
        writer.append(op("A", OpType::Create, "TASK", "t2", [("A", 2)]), OpSource::Local, AppendOptions::default()).await?;
        let rejected = op("A", OpType::Create, "TASK", "gone", [("A", 3)]);
        writer.append(rejected.clone(), OpSource::Local, AppendOptions::default()).await?;
        writer.mark_rejected(&[rejected.id]).await?;
        let pending = op("B", OpType::Create, "TASK", "late", [("B", 1)]);
        writer.append(pending, OpSource::Remote, AppendOptions::pending()).await?;
        drop(writer);

        let state = Arc::new(MemoryStateStore::new(AppState::new()));
        let report = hydrator(&store, state.clone(), SchemaMigrator::identity(SchemaConfig::default())?).hydrate().await?;
        assert_eq!(report, HydrationReport { snapshot_loaded: true, migrated_from: None, replayed: 1, recovered: 1 });
        assert_eq!(state.snapshot()?, tasks(&["late", "old", "t2"]));
        assert!(store.get_pending_remote_ops().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn full_state_op_in_tail_replaces_earlier_entries() -> anyhow::Result<()> {
        let store = store();
        let writer = store.writer().await?;
        writer.append(op("A", OpType::Create, "TASK", "before", [("A", 1)]), OpSource::Local, AppendOptions::default()).await?;
        let mut import = op("B", OpType::SyncImport, "ALL", "*", [("B", 4)]);
        import.entity_id = None;
        import.payload = tasks(&["imported"]).to_value()?;
        writer.append(import, OpSource::Remote, AppendOptions::default()).await?;
        writer.append(op("A", OpType::Create, "TASK", "after", [("A", 2), ("B", 4)]), OpSource::Local, AppendOptions::default()).await?;
        drop(writer);

        let state = Arc::new(MemoryStateStore::new(AppState::new()));
        let report = hydrator(&store, state.clone(), SchemaMigrator::identity(SchemaConfig::default())?).hydrate().await?;
        assert!(!report.snapshot_loaded);
        assert_eq!(report.replayed, 2);
        assert_eq!(state.snapshot()?, tasks(&["after", "imported"]));
        Ok(())
    }

    fn add_done_flag(mut state: Value) -> Result<Value, String> {
        let tasks = state.pointer_mut("/TASK/entities").and_then(Value::as_object_mut).ok_or("no tasks")?;
        for task in tasks.values_mut() {
            task["done"] = json!(false);
        }
        Ok(state)
    }

    #[tokio::test]
    async fn older_snapshot_is_migrated() -> anyhow::Result<()> {
        let store = store();
        store
            .writer()
            .await?
            .save_state_cache(StateCache {
                state: tasks(&["t1"]).to_value()?,
                last_applied_op_seq: 0,
                vector_clock: VectorClock::new(),
                compacted_at: 0,
                schema_version: 1,
                snapshot_entity_keys: None,
            })
            .await?;

        let config = SchemaConfig { current_version: 2, min_supported_version: 1, max_version_skip: 1 };
        let step = SchemaMigration { from_version: 1, to_version: 2, description: "tasks gain done", migrate_state: add_done_flag, migrate_operation: None };
        let migrator = SchemaMigrator::new(config, vec![step])?;

        let state = Arc::new(MemoryStateStore::new(AppState::new()));
        let report = hydrator(&store, state.clone(), migrator).hydrate().await?;
        assert_eq!(report.migrated_from, Some(1));
        assert_eq!(*state.snapshot()?.entity("TASK", "t1").unwrap(), json!({"id": "t1", "done": false}));
        Ok(())
    }
}
