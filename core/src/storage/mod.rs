pub mod memory;

use async_trait::async_trait;
use oplog_proto::{OpId, OpSource, Operation, OperationLogEntry, StateCache};

use crate::error::StorageError;

pub use memory::MemoryOpLogStorage;

/// Raw persistence for the operation log.
///
/// Implementations do no locking of their own beyond what keeps each call atomic; callers go
/// through [`crate::store::OpLogStore`], which serializes writers.
#[async_trait]
pub trait OpLogStorage: Send + Sync {
    /// Append an entry, assigning the next sequence number. Sequence numbers are never reused,
    /// even after the entries holding them are deleted.
    async fn append_entry(&self, op: Operation, source: OpSource, applied_at: i64, synced_at: Option<i64>, pending_apply: bool)
        -> Result<u64, StorageError>;

    async fn get_entry(&self, seq: u64) -> Result<Option<OperationLogEntry>, StorageError>;

    async fn get_entry_by_op_id(&self, op_id: &OpId) -> Result<Option<OperationLogEntry>, StorageError>;

    async fn contains_op(&self, op_id: &OpId) -> Result<bool, StorageError> { Ok(self.get_entry_by_op_id(op_id).await?.is_some()) }

    /// All entries in sequence order
    async fn entries(&self) -> Result<Vec<OperationLogEntry>, StorageError>;

    /// Entries with `seq > after`, in sequence order
    async fn entries_after(&self, after: u64) -> Result<Vec<OperationLogEntry>, StorageError> {
        Ok(self.entries().await?.into_iter().filter(|e| e.seq > after).collect())
    }

    /// Overwrite existing entries, matched by seq
    async fn put_entries(&self, entries: Vec<OperationLogEntry>) -> Result<(), StorageError>;

    async fn delete_entries(&self, seqs: Vec<u64>) -> Result<usize, StorageError>;

    /// Highest sequence number ever assigned, 0 for an empty log
    async fn last_seq(&self) -> Result<u64, StorageError>;

    async fn load_state_cache(&self) -> Result<Option<StateCache>, StorageError>;

    async fn save_state_cache(&self, cache: StateCache) -> Result<(), StorageError>;

    async fn get_meta(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    async fn put_meta(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError>;
}

/// Meta keys shared by all storage backends
pub mod meta {
    /// Clock contributions from applied remote ops
    pub const VECTOR_CLOCK: &str = "vector_clock";
    pub const LAST_SERVER_SEQ: &str = "last_server_seq";
    pub const COMPACTION_COUNTER: &str = "compaction_counter";
}
