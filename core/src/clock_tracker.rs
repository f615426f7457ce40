use std::collections::{BTreeSet, HashMap};

use oplog_proto::{ClientId, EntityKey, VectorClock};

use crate::{error::StorageError, store::OpLogStore};

/// Derives global and per-entity causal state from the log and snapshot.
#[derive(Clone)]
pub struct VectorClockTracker {
    store: OpLogStore,
}

impl VectorClockTracker {
    pub fn new(store: OpLogStore) -> Self { Self { store } }

    /// Merge of the snapshot clock, clocks of applied remote ops, and every logged op clock
    pub async fn current_vector_clock(&self) -> Result<VectorClock, StorageError> {
        let mut clock = match self.store.load_state_cache().await? {
            Some(cache) => cache.vector_clock,
            None => VectorClock::new(),
        };
        clock.merge(&self.store.persisted_vector_clock().await?);
        for entry in self.store.entries().await? {
            clock.merge(&entry.op.vector_clock);
        }
        Ok(clock)
    }

    /// The current clock with the local client's counter bumped; dominates everything known locally
    pub async fn next_clock(&self, client: &ClientId) -> Result<VectorClock, StorageError> {
        Ok(self.current_vector_clock().await?.incremented(client))
    }

    /// Per entity, the merge of every applied (not pending, not rejected) op clock touching it
    pub async fn entity_frontier(&self) -> Result<HashMap<EntityKey, VectorClock>, StorageError> {
        let mut frontier: HashMap<EntityKey, VectorClock> = HashMap::new();
        for entry in self.store.entries().await?.into_iter().filter(|e| e.is_applied()) {
            for key in entry.op.entity_keys() {
                frontier.entry(key).or_default().merge(&entry.op.vector_clock);
            }
        }
        Ok(frontier)
    }

    /// `None` when there is no snapshot or it predates entity-key tracking
    pub async fn snapshot_entity_keys(&self) -> Result<Option<BTreeSet<EntityKey>>, StorageError> {
        Ok(self.store.load_state_cache().await?.and_then(|cache| cache.snapshot_entity_keys))
    }

    pub async fn snapshot_clock(&self) -> Result<Option<VectorClock>, StorageError> { Ok(self.store.load_state_cache().await?.map(|c| c.vector_clock)) }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use oplog_proto::{OpSource, OpType, StateCache};

    use super::*;
    use crate::{lock::InProcessLock, storage::MemoryOpLogStorage, store::AppendOptions, testing::op};

    #[tokio::test]
    async fn frontier_covers_applied_ops_only() -> anyhow::Result<()> {
        let store = OpLogStore::new(Arc::new(MemoryOpLogStorage::new()), Arc::new(InProcessLock::new()));
        let tracker = VectorClockTracker::new(store.clone());
        {
            let w = store.writer().await?;
            w.append(op("A", OpType::Create, "TASK", "t1", [("A", 1)]), OpSource::Local, AppendOptions::default()).await?;
            w.append(op("B", OpType::Update, "TASK", "t1", [("A", 1), ("B", 1)]), OpSource::Remote, AppendOptions::default()).await?;
            // still pending: must not count
            w.append(op("B", OpType::Update, "TASK", "t1", [("A", 1), ("B", 2)]), OpSource::Remote, AppendOptions::pending()).await?;
            let rejected = op("A", OpType::Update, "TASK", "t2", [("A", 9)]);
            let rejected_id = rejected.id;
            w.append(rejected, OpSource::Local, AppendOptions::default()).await?;
            w.mark_rejected(&[rejected_id]).await?;
        }

        let frontier = tracker.entity_frontier().await?;
        assert_eq!(frontier[&EntityKey::new("TASK", "t1")], VectorClock::from([("A", 1), ("B", 1)]));
        assert!(!frontier.contains_key(&EntityKey::new("TASK", "t2")));

        // the global clock includes everything that was ever logged
        assert_eq!(tracker.current_vector_clock().await?, VectorClock::from([("A", 9), ("B", 2)]));
        Ok(())
    }

    #[tokio::test]
    async fn global_clock_survives_compaction_through_snapshot() -> anyhow::Result<()> {
        let store = OpLogStore::new(Arc::new(MemoryOpLogStorage::new()), Arc::new(InProcessLock::new()));
        let tracker = VectorClockTracker::new(store.clone());
        store
            .writer()
            .await?
            .save_state_cache(StateCache {
                state: serde_json::json!({}),
                last_applied_op_seq: 0,
                vector_clock: VectorClock::from([("A", 7), ("C", 2)]),
                compacted_at: 0,
                schema_version: 1,
                snapshot_entity_keys: None,
            })
            .await?;

        let next = tracker.next_clock(&"A".into()).await?;
        assert_eq!(next, VectorClock::from([("A", 8), ("C", 2)]));
        assert_eq!(tracker.snapshot_entity_keys().await?, None);
        Ok(())
    }
}
