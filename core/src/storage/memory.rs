use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use oplog_proto::{OpId, OpSource, Operation, OperationLogEntry, StateCache};

use super::OpLogStorage;
use crate::error::StorageError;

/// Non-durable log storage for tests and ephemeral clients
#[derive(Default)]
pub struct MemoryOpLogStorage {
    inner: RwLock<Inner>,
    entry_limit: Option<usize>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<u64, OperationLogEntry>,
    by_op_id: HashMap<OpId, u64>,
    next_seq: u64,
    state_cache: Option<StateCache>,
    meta: HashMap<String, serde_json::Value>,
}

impl MemoryOpLogStorage {
    pub fn new() -> Self { Self::default() }

    /// Refuse appends with [`StorageError::QuotaExceeded`] once `limit` entries are stored
    pub fn with_entry_limit(limit: usize) -> Self { Self { entry_limit: Some(limit), ..Self::default() } }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StorageError> {
        self.inner.read().map_err(|_| StorageError::Corrupt("memory storage lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StorageError> {
        self.inner.write().map_err(|_| StorageError::Corrupt("memory storage lock poisoned".into()))
    }
}

#[async_trait]
impl OpLogStorage for MemoryOpLogStorage {
    async fn append_entry(
        &self,
        op: Operation,
        source: OpSource,
        applied_at: i64,
        synced_at: Option<i64>,
        pending_apply: bool,
    ) -> Result<u64, StorageError> {
        let mut inner = self.write()?;
        if let Some(limit) = self.entry_limit {
            if inner.entries.len() >= limit {
                return Err(StorageError::QuotaExceeded(format!("{} of {} entries", inner.entries.len(), limit)));
            }
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.by_op_id.insert(op.id, seq);
        inner.entries.insert(seq, OperationLogEntry { seq, op, applied_at, source, synced_at, rejected_at: None, pending_apply, failed_attempts: 0 });
        Ok(seq)
    }

    async fn get_entry(&self, seq: u64) -> Result<Option<OperationLogEntry>, StorageError> { Ok(self.read()?.entries.get(&seq).cloned()) }

    async fn get_entry_by_op_id(&self, op_id: &OpId) -> Result<Option<OperationLogEntry>, StorageError> {
        let inner = self.read()?;
        Ok(inner.by_op_id.get(op_id).and_then(|seq| inner.entries.get(seq)).cloned())
    }

    async fn entries(&self) -> Result<Vec<OperationLogEntry>, StorageError> { Ok(self.read()?.entries.values().cloned().collect()) }

    async fn entries_after(&self, after: u64) -> Result<Vec<OperationLogEntry>, StorageError> {
        Ok(self.read()?.entries.range(after + 1..).map(|(_, e)| e.clone()).collect())
    }

    async fn put_entries(&self, entries: Vec<OperationLogEntry>) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        for entry in entries {
            if !inner.entries.contains_key(&entry.seq) {
                return Err(StorageError::Corrupt(format!("no entry with seq {}", entry.seq)));
            }
            inner.entries.insert(entry.seq, entry);
        }
        Ok(())
    }

    async fn delete_entries(&self, seqs: Vec<u64>) -> Result<usize, StorageError> {
        let mut inner = self.write()?;
        let mut deleted = 0;
        for seq in seqs {
            if let Some(entry) = inner.entries.remove(&seq) {
                inner.by_op_id.remove(&entry.op.id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn last_seq(&self) -> Result<u64, StorageError> { Ok(self.read()?.next_seq) }

    async fn load_state_cache(&self) -> Result<Option<StateCache>, StorageError> { Ok(self.read()?.state_cache.clone()) }

    async fn save_state_cache(&self, cache: StateCache) -> Result<(), StorageError> {
        self.write()?.state_cache = Some(cache);
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> { Ok(self.read()?.meta.get(key).cloned()) }

    async fn put_meta(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.write()?.meta.insert(key.to_string(), value);
        Ok(())
    }
}
