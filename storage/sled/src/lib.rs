//! Durable [`OpLogStorage`](oplog_core::storage::OpLogStorage) on top of sled.

pub mod database;
pub mod engine;
pub mod error;

pub use engine::SledOpLogStorage;
pub use error::SledStorageError;
