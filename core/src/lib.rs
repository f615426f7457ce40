pub mod applier;
pub mod capture;
pub mod client;
pub mod clock_tracker;
pub mod compaction;
pub mod config;
pub mod conflict;
pub mod error;
pub mod hydrator;
pub mod import_filter;
pub mod lock;
pub mod migration;
pub mod notify;
pub mod rejected;
pub mod resolver;
pub mod server_migration;
pub mod stale;
pub mod state;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transport;
pub mod util;
pub mod validation;

#[cfg(test)]
mod testing;

pub use client::OpLogClient;
pub use config::OpLogConfig;
pub use error::OpLogError;
pub use store::OpLogStore;
pub use sync::SyncOrchestrator;

pub use oplog_proto as proto;
