use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use oplog_core::{error::StorageError, storage::OpLogStorage};
use oplog_proto::{OpId, OpSource, Operation, OperationLogEntry, StateCache};
use sled::{
    transaction::{ConflictableTransactionResult, Transactional},
    Config,
};
use tokio::task;
use tracing::debug;

use crate::{
    database::{decode_seq, seq_key, Database, LAST_SEQ_KEY, STATE_CACHE_KEY},
    error::{abort, SledStorageError},
};

/// Operation log persisted in sled trees. Cloning shares the same database.
#[derive(Clone)]
pub struct SledOpLogStorage {
    pub database: Arc<Database>,
}

impl SledOpLogStorage {
    pub fn with_homedir_folder(folder_name: &str) -> anyhow::Result<Self> {
        let dir = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?.join(folder_name);

        Self::with_path(dir)
    }

    pub fn with_path(path: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&path)?;
        let db = sled::open(path.join("oplog"))?;
        Ok(Self { database: Arc::new(Database::open(db)?) })
    }

    pub fn new() -> anyhow::Result<Self> { Self::with_homedir_folder(".oplog") }

    pub fn new_test() -> anyhow::Result<Self> {
        let db = Config::new().temporary(true).flush_every_ms(None).open()?;
        Ok(Self { database: Arc::new(Database::open(db)?) })
    }

    /// Wait until everything written so far is on disk
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.database.db.flush_async().await.map_err(SledStorageError::from)?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, SledStorageError> + Send + 'static,
    {
        // sled calls block the calling thread
        let database = self.database.clone();
        Ok(task::spawn_blocking(move || f(&database)).await??)
    }
}

fn decode_entry(bytes: &[u8]) -> Result<OperationLogEntry, SledStorageError> { Ok(serde_json::from_slice(bytes)?) }

impl Database {
    fn append_entry_blocking(&self, entry: OperationLogEntry) -> Result<u64, SledStorageError> {
        let seq = (&self.ops, &self.ops_by_id, &self.system).transaction(|(ops, by_id, system)| -> ConflictableTransactionResult<u64, SledStorageError> {
            let seq = match system.get(LAST_SEQ_KEY)? {
                Some(bytes) => decode_seq(&bytes).map_err(abort)? + 1,
                None => 1,
            };
            let entry = OperationLogEntry { seq, ..entry.clone() };
            let bytes = serde_json::to_vec(&entry).map_err(abort)?;
            ops.insert(&seq_key(seq)[..], bytes)?;
            by_id.insert(&entry.op.id.to_bytes()[..], &seq_key(seq)[..])?;
            system.insert(LAST_SEQ_KEY, &seq_key(seq)[..])?;
            Ok(seq)
        })?;
        Ok(seq)
    }

    fn get_entry_blocking(&self, seq: u64) -> Result<Option<OperationLogEntry>, SledStorageError> {
        self.ops.get(seq_key(seq))?.map(|bytes| decode_entry(&bytes)).transpose()
    }

    fn get_entry_by_op_id_blocking(&self, op_id: OpId) -> Result<Option<OperationLogEntry>, SledStorageError> {
        match self.ops_by_id.get(op_id.to_bytes())? {
            Some(seq) => self.get_entry_blocking(decode_seq(&seq)?),
            None => Ok(None),
        }
    }

    fn entries_after_blocking(&self, after: u64) -> Result<Vec<OperationLogEntry>, SledStorageError> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for item in self.ops.range(seq_key(start)..) {
            let (_key, bytes) = item?;
            entries.push(decode_entry(&bytes)?);
        }
        Ok(entries)
    }

    fn put_entries_blocking(&self, entries: Vec<OperationLogEntry>) -> Result<(), SledStorageError> {
        let mut batch = sled::Batch::default();
        for entry in &entries {
            if !self.ops.contains_key(seq_key(entry.seq))? {
                return Err(SledStorageError::MissingEntry(entry.seq));
            }
            batch.insert(&seq_key(entry.seq)[..], serde_json::to_vec(entry)?);
        }
        self.ops.apply_batch(batch)?;
        Ok(())
    }

    fn delete_entries_blocking(&self, seqs: Vec<u64>) -> Result<usize, SledStorageError> {
        let deleted = (&self.ops, &self.ops_by_id).transaction(|(ops, by_id)| -> ConflictableTransactionResult<usize, SledStorageError> {
            let mut deleted = 0;
            for seq in &seqs {
                if let Some(bytes) = ops.remove(&seq_key(*seq)[..])? {
                    let entry = decode_entry(&bytes).map_err(abort)?;
                    by_id.remove(&entry.op.id.to_bytes()[..])?;
                    deleted += 1;
                }
            }
            Ok(deleted)
        })?;
        Ok(deleted)
    }

    fn last_seq_blocking(&self) -> Result<u64, SledStorageError> {
        match self.system.get(LAST_SEQ_KEY)? {
            Some(bytes) => decode_seq(&bytes),
            None => Ok(0),
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(tree: &sled::Tree, key: &str) -> Result<Option<T>, SledStorageError> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(tree: &sled::Tree, key: &str, value: &T) -> Result<(), SledStorageError> {
        tree.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }
}

#[async_trait]
impl OpLogStorage for SledOpLogStorage {
    async fn append_entry(
        &self,
        op: Operation,
        source: OpSource,
        applied_at: i64,
        synced_at: Option<i64>,
        pending_apply: bool,
    ) -> Result<u64, StorageError> {
        let entry = OperationLogEntry { seq: 0, op, applied_at, source, synced_at, rejected_at: None, pending_apply, failed_attempts: 0 };
        let seq = self.blocking(move |db| db.append_entry_blocking(entry)).await?;
        debug!("sled: appended seq {}", seq);
        Ok(seq)
    }

    async fn get_entry(&self, seq: u64) -> Result<Option<OperationLogEntry>, StorageError> { self.blocking(move |db| db.get_entry_blocking(seq)).await }

    async fn get_entry_by_op_id(&self, op_id: &OpId) -> Result<Option<OperationLogEntry>, StorageError> {
        let op_id = *op_id;
        self.blocking(move |db| db.get_entry_by_op_id_blocking(op_id)).await
    }

    async fn contains_op(&self, op_id: &OpId) -> Result<bool, StorageError> {
        let key = op_id.to_bytes();
        self.blocking(move |db| Ok(db.ops_by_id.contains_key(key)?)).await
    }

    async fn entries(&self) -> Result<Vec<OperationLogEntry>, StorageError> { self.entries_after(0).await }

    async fn entries_after(&self, after: u64) -> Result<Vec<OperationLogEntry>, StorageError> {
        self.blocking(move |db| db.entries_after_blocking(after)).await
    }

    async fn put_entries(&self, entries: Vec<OperationLogEntry>) -> Result<(), StorageError> {
        self.blocking(move |db| db.put_entries_blocking(entries)).await
    }

    async fn delete_entries(&self, seqs: Vec<u64>) -> Result<usize, StorageError> {
        self.blocking(move |db| db.delete_entries_blocking(seqs)).await
    }

    async fn last_seq(&self) -> Result<u64, StorageError> { self.blocking(|db| db.last_seq_blocking()).await }

    async fn load_state_cache(&self) -> Result<Option<StateCache>, StorageError> {
        self.blocking(|db| Database::get_json(&db.system, STATE_CACHE_KEY)).await
    }

    async fn save_state_cache(&self, cache: StateCache) -> Result<(), StorageError> {
        self.blocking(move |db| Database::put_json(&db.system, STATE_CACHE_KEY, &cache)).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let key = key.to_string();
        self.blocking(move |db| Database::get_json(&db.meta, &key)).await
    }

    async fn put_meta(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let key = key.to_string();
        self.blocking(move |db| Database::put_json(&db.meta, &key, &value)).await
    }
}
