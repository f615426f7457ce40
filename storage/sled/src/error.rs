use oplog_core::error::StorageError;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SledStorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid key length {0}")]
    InvalidKeyLength(usize),
    #[error("no entry with seq {0}")]
    MissingEntry(u64),
}

impl From<SledStorageError> for StorageError {
    fn from(err: SledStorageError) -> Self {
        match err {
            SledStorageError::Encoding(e) => StorageError::Serialization(e),
            SledStorageError::InvalidKeyLength(_) | SledStorageError::MissingEntry(_) => StorageError::Corrupt(err.to_string()),
            SledStorageError::Sled(sled::Error::Io(e)) if e.kind() == std::io::ErrorKind::StorageFull => StorageError::QuotaExceeded(e.to_string()),
            SledStorageError::Sled(e) => StorageError::Backend(Box::new(e)),
        }
    }
}

impl From<TransactionError<SledStorageError>> for SledStorageError {
    fn from(err: TransactionError<SledStorageError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => SledStorageError::Sled(e),
        }
    }
}

/// Abort a transaction with a storage-level failure
pub(crate) fn abort(err: impl Into<SledStorageError>) -> ConflictableTransactionError<SledStorageError> { ConflictableTransactionError::Abort(err.into()) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_disk_maps_to_quota_exceeded() {
        let full = SledStorageError::Sled(sled::Error::Io(std::io::Error::from(std::io::ErrorKind::StorageFull)));
        assert!(matches!(StorageError::from(full), StorageError::QuotaExceeded(_)));
        let other = SledStorageError::Sled(sled::Error::Unsupported("x".into()));
        assert!(matches!(StorageError::from(other), StorageError::Backend(_)));
    }
}
