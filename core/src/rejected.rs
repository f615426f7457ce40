use std::sync::Arc;

use async_trait::async_trait;
use oplog_proto::{OpId, OpUploadResult, Operation, OperationLogEntry, RejectionCode};
use tracing::{debug, warn};

use crate::{
    action_warn,
    error::OpLogError,
    notify::{Notice, Notifier},
    stale::StaleOpResolver,
    store::OpLogStore,
    sync::{DownloadOptions, DownloadOutcome},
};

/// Lets the rejection path trigger a download without owning the orchestrator
#[async_trait]
pub trait DownloadHandle: Send + Sync {
    async fn download(&self, options: DownloadOptions) -> Result<DownloadOutcome, OpLogError>;
}

/// Routes server rejections to permanent rejection, retry, or stale resolution.
#[derive(Clone)]
pub struct RejectedOpsHandler {
    store: OpLogStore,
    stale: StaleOpResolver,
    notifier: Arc<dyn Notifier>,
    max_rejected_ops_before_warning: usize,
}

impl RejectedOpsHandler {
    pub fn new(store: OpLogStore, stale: StaleOpResolver, notifier: Arc<dyn Notifier>, max_rejected_ops_before_warning: usize) -> Self {
        Self { store, stale, notifier, max_rejected_ops_before_warning }
    }

    /// Handle the rejected results of an upload. Returns the number of new ops created, which
    /// the caller should upload in a follow-up pass.
    pub async fn handle_rejected_ops(&self, results: &[OpUploadResult], download: &dyn DownloadHandle) -> Result<usize, OpLogError> {
        let mut permanent: Vec<OpId> = Vec::new();
        let mut concurrent: Vec<OperationLogEntry> = Vec::new();
        let mut quota_exceeded = false;

        for result in results.iter().filter(|r| !r.accepted) {
            let Some(entry) = self.store.get_op_by_id(&result.op_id).await? else {
                debug!("rejected op {:#} is no longer in the log", result.op_id);
                continue;
            };
            if entry.is_synced() || entry.is_rejected() {
                continue;
            }
            match result.error_code {
                Some(RejectionCode::StorageQuotaExceeded) => quota_exceeded = true,
                Some(RejectionCode::InternalError) => debug!("op {:#} hit a transient server error; will retry", result.op_id),
                Some(RejectionCode::ConflictConcurrent) | Some(RejectionCode::ConflictStale) => concurrent.push(entry),
                _ => {
                    warn!("op {:#} permanently rejected: {}", result.op_id, result.error.as_deref().unwrap_or("no reason given"));
                    permanent.push(result.op_id);
                }
            }
        }

        if quota_exceeded {
            self.notifier.notify(Notice::StorageQuotaExceeded);
        }
        if !permanent.is_empty() {
            self.store.writer().await?.mark_rejected(&permanent).await?;
            if permanent.len() >= self.max_rejected_ops_before_warning {
                self.notifier.notify(Notice::OpsRejected { count: permanent.len() });
            }
        }
        if concurrent.is_empty() {
            return Ok(0);
        }
        self.resolve_concurrent(concurrent, download).await
    }

    /// Download first so conflict detection can see the competing ops. Whatever is still pending
    /// afterwards is rebuilt by the stale resolver.
    async fn resolve_concurrent(&self, rejected: Vec<OperationLogEntry>, download: &dyn DownloadHandle) -> Result<usize, OpLogError> {
        let first = self.try_download(download, DownloadOptions::default()).await;
        let still_pending = self.still_pending(&rejected).await?;
        if still_pending.is_empty() {
            return Ok(0);
        }

        if first.new_ops > 0 {
            // the download brought ops but did not settle these; resolve against the local snapshot
            let snapshot_clock = self.store.load_state_cache().await?.map(|c| c.vector_clock);
            return self.stale.resolve_stale_local_ops(still_pending, Vec::new(), snapshot_clock).await;
        }

        // we already had the competing ops; fetch every clock the server knows
        let forced = self.try_download(download, DownloadOptions { force_from_seq0: true }).await;
        let still_pending = self.still_pending(&rejected).await?;
        if still_pending.is_empty() {
            return Ok(0);
        }
        if forced.all_op_clocks.is_empty() && forced.snapshot_vector_clock.is_none() {
            let ids: Vec<OpId> = still_pending.iter().map(|op| op.id).collect();
            action_warn!("RejectedOpsHandler", "conflict resolution failed", "no clocks available; rejecting {} op(s)", ids.len());
            self.store.writer().await?.mark_rejected(&ids).await?;
            self.notifier.notify(Notice::ConflictResolutionFailed { count: ids.len() });
            return Ok(0);
        }
        self.stale.resolve_stale_local_ops(still_pending, forced.all_op_clocks, forced.snapshot_vector_clock).await
    }

    async fn try_download(&self, download: &dyn DownloadHandle, options: DownloadOptions) -> DownloadOutcome {
        match download.download(options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("download during rejection handling failed: {}", e);
                DownloadOutcome::default()
            }
        }
    }

    async fn still_pending(&self, rejected: &[OperationLogEntry]) -> Result<Vec<Operation>, OpLogError> {
        let mut pending = Vec::with_capacity(rejected.len());
        for entry in rejected {
            if let Some(current) = self.store.get_op_by_id(&entry.op.id).await? {
                if current.is_unsynced_local() {
                    pending.push(current.op);
                }
            }
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        lock::InProcessLock,
        notify::MemoryNotifier,
        state::{AppState, MemoryStateStore},
        storage::MemoryOpLogStorage,
        store::AppendOptions,
        testing::op,
    };
    use oplog_proto::{OpSource, OpType, VectorClock};
    use serde_json::json;

    /// Replays canned outcomes and records the options it was called with
    #[derive(Default)]
    struct ScriptedDownload {
        outcomes: Mutex<Vec<Result<DownloadOutcome, OpLogError>>>,
        calls: Mutex<Vec<DownloadOptions>>,
    }

    impl ScriptedDownload {
        fn new(outcomes: Vec<Result<DownloadOutcome, OpLogError>>) -> Self { Self { outcomes: Mutex::new(outcomes), calls: Mutex::new(Vec::new()) } }

        fn calls(&self) -> Vec<DownloadOptions> { self.calls.lock().unwrap().clone() }
    }

    #[async_trait]
    impl DownloadHandle for ScriptedDownload {
        async fn download(&self, options: DownloadOptions) -> Result<DownloadOutcome, OpLogError> {
            self.calls.lock().unwrap().push(options);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(DownloadOutcome::default())
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct Fixture {
        store: OpLogStore,
        notifier: Arc<MemoryNotifier>,
        handler: RejectedOpsHandler,
    }

    fn fixture() -> Fixture {
        let store = OpLogStore::new(Arc::new(MemoryOpLogStorage::new()), Arc::new(InProcessLock::new()));
        let state = Arc::new(MemoryStateStore::new(AppState::new().with_entities("TASK", [("t1", json!({"id": "t1"}))].into_iter().collect())));
        let notifier = Arc::new(MemoryNotifier::default());
        let stale = StaleOpResolver::new(store.clone(), state, "A".into(), 1);
        let handler = RejectedOpsHandler::new(store.clone(), stale, notifier.clone(), 2);
        Fixture { store, notifier, handler }
    }

    async fn local(f: &Fixture, n: u64) -> anyhow::Result<Operation> {
        let o = op("A", OpType::Update, "TASK", "t1", [("A", n)]);
        f.store.writer().await?.append(o.clone(), OpSource::Local, AppendOptions::default()).await?;
        Ok(o)
    }

    #[tokio::test]
    async fn classifies_by_error_code() -> anyhow::Result<()> {
        let f = fixture();
        let quota = local(&f, 1).await?;
        let transient = local(&f, 2).await?;
        let invalid = local(&f, 3).await?;
        let unknown = local(&f, 4).await?;
        let results = vec![
            OpUploadResult::rejected(quota.id, RejectionCode::StorageQuotaExceeded, "full"),
            OpUploadResult::rejected(transient.id, RejectionCode::InternalError, "oops"),
            OpUploadResult::rejected(invalid.id, RejectionCode::ValidationError, "bad"),
            OpUploadResult::rejected(unknown.id, RejectionCode::Unknown, "?"),
            OpUploadResult::rejected(oplog_proto::OpId::new(), RejectionCode::ValidationError, "missing"),
        ];

        let download = ScriptedDownload::default();
        assert_eq!(f.handler.handle_rejected_ops(&results, &download).await?, 0);
        assert!(download.calls().is_empty());

        let pending: Vec<_> = f.store.get_unsynced().await?.into_iter().map(|e| e.op.id).collect();
        assert_eq!(pending, vec![quota.id, transient.id]);
        assert_eq!(f.notifier.notices(), vec![Notice::StorageQuotaExceeded, Notice::OpsRejected { count: 2 }]);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_rejection_forces_full_download_and_resolves_with_its_clocks() -> anyhow::Result<()> {
        let f = fixture();
        let pending = local(&f, 1).await?;
        let forced = DownloadOutcome { all_op_clocks: vec![VectorClock::from([("B", 5)])], ..Default::default() };
        let download = ScriptedDownload::new(vec![Ok(DownloadOutcome::default()), Ok(forced)]);

        let created = f.handler.handle_rejected_ops(&[OpUploadResult::rejected(pending.id, RejectionCode::ConflictConcurrent, "c")], &download).await?;
        assert_eq!(created, 1);
        assert_eq!(download.calls(), vec![DownloadOptions::default(), DownloadOptions { force_from_seq0: true }]);

        let unsynced = f.store.get_unsynced().await?;
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].op.vector_clock, VectorClock::from([("A", 2), ("B", 5)]));
        Ok(())
    }

    #[tokio::test]
    async fn no_clocks_anywhere_rejects_and_notifies() -> anyhow::Result<()> {
        let f = fixture();
        let pending = local(&f, 1).await?;
        let download = ScriptedDownload::new(vec![Err(OpLogError::FlushTimeout(std::time::Duration::from_millis(1))), Ok(DownloadOutcome::default())]);

        let created = f.handler.handle_rejected_ops(&[OpUploadResult::rejected(pending.id, RejectionCode::ConflictStale, "s")], &download).await?;
        assert_eq!(created, 0);
        assert!(f.store.get_op_by_id(&pending.id).await?.unwrap().is_rejected());
        assert_eq!(f.notifier.notices(), vec![Notice::ConflictResolutionFailed { count: 1 }]);
        Ok(())
    }

    #[tokio::test]
    async fn download_with_new_ops_resolves_against_snapshot_clock() -> anyhow::Result<()> {
        let f = fixture();
        let pending = local(&f, 1).await?;
        let download = ScriptedDownload::new(vec![Ok(DownloadOutcome { new_ops: 3, ..Default::default() })]);

        let created = f.handler.handle_rejected_ops(&[OpUploadResult::rejected(pending.id, RejectionCode::ConflictConcurrent, "c")], &download).await?;
        assert_eq!(created, 1);
        assert_eq!(download.calls().len(), 1);
        Ok(())
    }
}
