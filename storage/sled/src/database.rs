use sled::Db;

use crate::error::SledStorageError;

/// Key in the `system` tree holding the highest seq ever assigned
pub(crate) const LAST_SEQ_KEY: &str = "last_seq";
/// Key in the `system` tree holding the compacted snapshot
pub(crate) const STATE_CACHE_KEY: &str = "state_cache";

pub struct Database {
    pub db: Db,
    /// seq (big-endian) → JSON entry; big-endian keys keep sled's iteration in seq order
    pub(crate) ops: sled::Tree,
    /// op id bytes → seq
    pub(crate) ops_by_id: sled::Tree,
    pub(crate) meta: sled::Tree,
    pub(crate) system: sled::Tree,
}

impl Database {
    pub fn open(db: Db) -> Result<Self, SledStorageError> {
        let ops = db.open_tree("ops")?;
        let ops_by_id = db.open_tree("ops_by_id")?;
        let meta = db.open_tree("meta")?;
        let system = db.open_tree("system")?;
        Ok(Self { db, ops, ops_by_id, meta, system })
    }
}

pub(crate) fn seq_key(seq: u64) -> [u8; 8] { seq.to_be_bytes() }

pub(crate) fn decode_seq(bytes: &[u8]) -> Result<u64, SledStorageError> {
    <[u8; 8]>::try_from(bytes).map(u64::from_be_bytes).map_err(|_| SledStorageError::InvalidKeyLength(bytes.len()))
}
