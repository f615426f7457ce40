use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{error, info, warn};

/// User-facing events raised by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The server is out of space; sync is blocked until the user acts
    StorageQuotaExceeded,
    /// Remote ops were authored by a schema this client no longer understands
    VersionTooOld { found: u32, min: u32 },
    /// Remote ops were authored by a much newer client; sync aborted until this client updates
    UpdateRequired { found: u32, current: u32 },
    /// Remote ops come from a newer client within the supported skip
    NewerVersionAvailable { found: u32, current: u32 },
    PartialApplyFailure { applied: usize, failed: usize, reason: String },
    OpsRejected { count: usize },
    ConflictResolutionFailed { count: usize },
    ConflictsAutoResolved { count: usize },
    FreshClientSyncCancelled { op_count: usize },
}

impl Notice {
    /// Blocking notices demand user action before sync can continue
    pub fn is_blocking(&self) -> bool { matches!(self, Notice::StorageQuotaExceeded | Notice::VersionTooOld { .. } | Notice::UpdateRequired { .. }) }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);

    /// Asked before a client with no history accepts its first remote batch
    async fn confirm_fresh_client_sync(&self, op_count: usize) -> bool;
}

/// Reports notices through tracing and confirms every fresh-client sync
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        if notice.is_blocking() {
            error!("sync notice: {:?}", notice);
        } else if matches!(notice, Notice::ConflictsAutoResolved { .. }) {
            info!("sync notice: {:?}", notice);
        } else {
            warn!("sync notice: {:?}", notice);
        }
    }

    async fn confirm_fresh_client_sync(&self, _op_count: usize) -> bool { true }
}

/// Records every notice. Fresh-client confirmation answers with a fixed value.
#[derive(Debug)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<Notice>>,
    confirm: bool,
}

impl Default for MemoryNotifier {
    fn default() -> Self { Self::new(true) }
}

impl MemoryNotifier {
    pub fn new(confirm: bool) -> Self { Self { notices: Mutex::new(Vec::new()), confirm } }

    pub fn notices(&self) -> Vec<Notice> { self.notices.lock().map(|n| n.clone()).unwrap_or_default() }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }

    async fn confirm_fresh_client_sync(&self, _op_count: usize) -> bool { self.confirm }
}
