use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use oplog_proto::{now_ms, EntityKey, OpId, OpSource, Operation, OperationLogEntry, StateCache, VectorClock};
use tracing::{debug, warn};

use crate::{
    config::{OP_LOG_LOCK, UPLOAD_LOCK},
    error::{LockError, StorageError},
    lock::{LockGuard, LockProvider},
    storage::{meta, OpLogStorage},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct AppendOptions {
    /// Remote op logged before it is applied; cleared by [`OpLogWriter::mark_applied`]
    pub pending_apply: bool,
}

impl AppendOptions {
    pub fn pending() -> Self { Self { pending_apply: true } }
}

/// Front door to the persisted log and snapshot.
///
/// Reads are unlocked. Every mutation goes through an [`OpLogWriter`], which can only be obtained
/// by acquiring the `sp_op_log` lock.
#[derive(Clone)]
pub struct OpLogStore {
    storage: Arc<dyn OpLogStorage>,
    locks: Arc<dyn LockProvider>,
    max_apply_retries: u32,
}

impl OpLogStore {
    pub fn new(storage: Arc<dyn OpLogStorage>, locks: Arc<dyn LockProvider>) -> Self { Self { storage, locks, max_apply_retries: 5 } }

    pub fn with_max_apply_retries(mut self, retries: u32) -> Self {
        self.max_apply_retries = retries;
        self
    }

    pub fn storage(&self) -> &Arc<dyn OpLogStorage> { &self.storage }

    /// Take the log write lock. Must not be called while the same task already holds a writer.
    pub async fn writer(&self) -> Result<OpLogWriter<'_>, LockError> {
        let guard = self.locks.acquire(OP_LOG_LOCK).await?;
        Ok(OpLogWriter { store: self, _guard: guard })
    }

    /// Serialize upload cycles across processes
    pub async fn upload_lock(&self) -> Result<LockGuard, LockError> { self.locks.acquire(UPLOAD_LOCK).await }

    /// Acquire and immediately release the write lock. Once this returns, every writer that held
    /// the lock before the call has committed.
    pub async fn barrier(&self) -> Result<(), LockError> {
        drop(self.writer().await?);
        Ok(())
    }

    pub async fn get_last_seq(&self) -> Result<u64, StorageError> { self.storage.last_seq().await }

    pub async fn get_op_by_id(&self, op_id: &OpId) -> Result<Option<OperationLogEntry>, StorageError> { self.storage.get_entry_by_op_id(op_id).await }

    pub async fn has_op(&self, op_id: &OpId) -> Result<bool, StorageError> { self.storage.contains_op(op_id).await }

    /// Drop ops that are already logged, and duplicates within `ops` itself
    pub async fn filter_new_ops(&self, ops: Vec<Operation>) -> Result<Vec<Operation>, StorageError> {
        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(ops.len());
        for op in ops {
            if seen.insert(op.id) && !self.storage.contains_op(&op.id).await? {
                fresh.push(op);
            }
        }
        Ok(fresh)
    }

    pub async fn entries(&self) -> Result<Vec<OperationLogEntry>, StorageError> { self.storage.entries().await }

    pub async fn get_ops_after_seq(&self, seq: u64) -> Result<Vec<OperationLogEntry>, StorageError> { self.storage.entries_after(seq).await }

    /// Local ops not yet accepted by the server nor rejected
    pub async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        Ok(self.storage.entries().await?.into_iter().filter(|e| e.is_unsynced_local()).collect())
    }

    /// Unsynced local ops keyed by every entity they touch
    pub async fn get_unsynced_by_entity(&self) -> Result<BTreeMap<EntityKey, Vec<Operation>>, StorageError> {
        let mut by_entity: BTreeMap<EntityKey, Vec<Operation>> = BTreeMap::new();
        for entry in self.get_unsynced().await? {
            for key in entry.op.entity_keys() {
                by_entity.entry(key).or_default().push(entry.op.clone());
            }
        }
        Ok(by_entity)
    }

    /// Remote ops logged but never confirmed applied, e.g. after a crash mid-apply
    pub async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        Ok(self.storage.entries().await?.into_iter().filter(|e| e.source == OpSource::Remote && e.pending_apply && e.rejected_at.is_none()).collect())
    }

    /// Most recent full-state op still in the log, from either source
    pub async fn latest_full_state_op(&self) -> Result<Option<Operation>, StorageError> {
        Ok(self.storage.entries().await?.into_iter().rev().find(|e| e.op.is_full_state() && !e.is_rejected()).map(|e| e.op))
    }

    /// Whether this client has ever exchanged ops with a server
    pub async fn has_synced_ops(&self) -> Result<bool, StorageError> { Ok(self.storage.entries().await?.iter().any(|e| e.is_synced())) }

    pub async fn load_state_cache(&self) -> Result<Option<StateCache>, StorageError> { self.storage.load_state_cache().await }

    /// Clock accumulated from applied remote ops that may since have been compacted away
    pub async fn persisted_vector_clock(&self) -> Result<VectorClock, StorageError> {
        match self.storage.get_meta(meta::VECTOR_CLOCK).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(VectorClock::new()),
        }
    }

    pub async fn last_server_seq(&self) -> Result<u64, StorageError> { self.meta_u64(meta::LAST_SERVER_SEQ).await }

    pub async fn compaction_counter(&self) -> Result<u64, StorageError> { self.meta_u64(meta::COMPACTION_COUNTER).await }

    async fn meta_u64(&self, key: &str) -> Result<u64, StorageError> {
        match self.storage.get_meta(key).await? {
            Some(value) => value.as_u64().ok_or_else(|| StorageError::Corrupt(format!("meta {} is not an integer", key))),
            None => Ok(0),
        }
    }
}

/// Holds the `sp_op_log` lock for its lifetime. Dereferences to [`OpLogStore`] for reads.
pub struct OpLogWriter<'a> {
    store: &'a OpLogStore,
    _guard: LockGuard,
}

impl std::ops::Deref for OpLogWriter<'_> {
    type Target = OpLogStore;
    fn deref(&self) -> &Self::Target { self.store }
}

impl OpLogWriter<'_> {
    /// Append `op` and return its seq. Remote ops count as synced on arrival.
    pub async fn append(&self, op: Operation, source: OpSource, options: AppendOptions) -> Result<u64, StorageError> {
        let now = now_ms();
        let applied_at = if options.pending_apply { 0 } else { now };
        let synced_at = match source {
            OpSource::Remote => Some(now),
            OpSource::Local => None,
        };
        let op_id = op.id;
        let seq = self.store.storage.append_entry(op, source, applied_at, synced_at, options.pending_apply).await?;
        debug!("appended {} op {:#} as seq {}", source, op_id, seq);
        Ok(seq)
    }

    pub async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StorageError> {
        let now = now_ms();
        self.update_by_seq(seqs, |entry| {
            entry.pending_apply = false;
            entry.applied_at = now;
        })
        .await
    }

    /// Record a failed apply attempt. Entries past the retry budget are given up on.
    pub async fn mark_failed(&self, seqs: &[u64]) -> Result<(), StorageError> {
        let now = now_ms();
        let max = self.store.max_apply_retries;
        self.update_by_seq(seqs, |entry| {
            entry.failed_attempts += 1;
            if entry.failed_attempts >= max && entry.rejected_at.is_none() {
                warn!("giving up on op {} after {} failed apply attempts", entry.op.id, entry.failed_attempts);
                entry.rejected_at = Some(now);
            }
        })
        .await
    }

    pub async fn mark_rejected(&self, op_ids: &[OpId]) -> Result<(), StorageError> {
        let now = now_ms();
        let mut updated = Vec::with_capacity(op_ids.len());
        for op_id in op_ids {
            if let Some(mut entry) = self.store.storage.get_entry_by_op_id(op_id).await? {
                if entry.rejected_at.is_none() {
                    entry.rejected_at = Some(now);
                    updated.push(entry);
                }
            }
        }
        self.store.storage.put_entries(updated).await
    }

    pub async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StorageError> {
        let now = now_ms();
        self.update_by_seq(seqs, |entry| {
            if entry.synced_at.is_none() {
                entry.synced_at = Some(now);
            }
        })
        .await
    }

    async fn update_by_seq(&self, seqs: &[u64], mut f: impl FnMut(&mut OperationLogEntry)) -> Result<(), StorageError> {
        let mut updated = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(mut entry) = self.store.storage.get_entry(*seq).await? {
                f(&mut entry);
                updated.push(entry);
            }
        }
        self.store.storage.put_entries(updated).await
    }

    pub async fn save_state_cache(&self, cache: StateCache) -> Result<(), StorageError> { self.store.storage.save_state_cache(cache).await }

    /// Delete every entry matching `predicate`, returning how many were removed
    pub async fn delete_ops_where(&self, predicate: impl Fn(&OperationLogEntry) -> bool) -> Result<usize, StorageError> {
        let doomed: Vec<u64> = self.store.storage.entries().await?.iter().filter(|e| predicate(e)).map(|e| e.seq).collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        self.store.storage.delete_entries(doomed).await
    }

    /// Fold the clocks of applied remote ops into the persisted clock so later local ops dominate them
    pub async fn merge_remote_op_clocks(&self, ops: &[Operation]) -> Result<(), StorageError> {
        let mut clock = self.store.persisted_vector_clock().await?;
        for op in ops {
            clock.merge(&op.vector_clock);
        }
        self.store.storage.put_meta(meta::VECTOR_CLOCK, serde_json::to_value(&clock)?).await
    }

    pub async fn set_last_server_seq(&self, seq: u64) -> Result<(), StorageError> { self.store.storage.put_meta(meta::LAST_SERVER_SEQ, seq.into()).await }

    pub async fn increment_compaction_counter(&self) -> Result<u64, StorageError> {
        let next = self.store.compaction_counter().await? + 1;
        self.store.storage.put_meta(meta::COMPACTION_COUNTER, next.into()).await?;
        Ok(next)
    }

    pub async fn reset_compaction_counter(&self) -> Result<(), StorageError> { self.store.storage.put_meta(meta::COMPACTION_COUNTER, 0u64.into()).await }
}
