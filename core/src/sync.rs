//! Top-level sync sequencing.
//!
//! One cycle is upload → download, with a follow-up upload when the cycle created new local
//! ops (LWW local wins, stale-op replacements, a server-migration import). Every remote op,
//! whether piggybacked on an upload response or downloaded, goes through
//! [`SyncOrchestrator::process_remote_ops`].

use std::sync::Arc;

use async_trait::async_trait;
use oplog_proto::{
    ClientId, DownloadRequest, OpId, OpUploadResult, OpType, Operation, OperationLogEntry, SnapshotReason, SnapshotUpload, UploadRequest,
    VectorClock,
};
use tracing::{debug, info, warn};

use crate::{
    action_debug, action_info, action_warn,
    applier::OperationApplier,
    capture::{flush_pending_writes, CaptureQueue},
    clock_tracker::VectorClockTracker,
    config::OpLogConfig,
    conflict::{detect_conflicts, DetectionContext},
    error::{MigrationError, OpLogError},
    import_filter::filter_ops_invalidated_by_import,
    migration::{SchemaGate, SchemaMigrator},
    notify::{Notice, Notifier},
    rejected::{DownloadHandle, RejectedOpsHandler},
    resolver::ConflictResolver,
    server_migration::{ServerMigration, SERVER_MIGRATION_ACTION},
    stale::StaleOpResolver,
    state::StateStore,
    store::{OpLogStore, OpLogWriter},
    transport::Transport,
    validation::{AlwaysValid, Repairer, StateValidator, ValidationContext},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Ignore the stored watermark and fetch the server's whole history
    pub force_from_seq0: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadOutcome {
    /// Ops not seen before this download
    pub new_ops: usize,
    pub local_win_ops_created: usize,
    /// The server was empty and a full-state import was queued; upload it next
    pub server_migration_handled: bool,
    /// A fresh client declined its first remote batch
    pub cancelled: bool,
    /// Clocks of every downloaded op; filled on forced downloads only
    pub all_op_clocks: Vec<VectorClock>,
    pub snapshot_vector_clock: Option<VectorClock>,
    pub latest_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOutcome {
    /// Refused because this client has no history yet
    pub blocked_fresh_client: bool,
    pub uploaded: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub piggybacked: usize,
    /// Local-win and stale-replacement ops created while handling the response
    pub local_win_ops_created: usize,
    pub server_migration: Option<OpId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub local_win_ops_created: usize,
    pub invalidated_by_import: usize,
    pub dropped_by_migration: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub upload: UploadOutcome,
    pub download: DownloadOutcome,
    pub follow_up: Option<UploadOutcome>,
    /// Repair op logged by the end-of-cycle validation; uploaded on the next cycle
    pub repair: Option<OpId>,
}

pub struct SyncOrchestrator {
    client_id: ClientId,
    config: OpLogConfig,
    store: OpLogStore,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    capture_queue: Option<Arc<CaptureQueue>>,
    tracker: VectorClockTracker,
    gate: SchemaGate,
    applier: OperationApplier,
    resolver: ConflictResolver,
    rejected: RejectedOpsHandler,
    server_migration: ServerMigration,
}

impl SyncOrchestrator {
    /// Orchestrator with no schema migrations and no state validation
    pub fn new(
        client_id: ClientId,
        config: OpLogConfig,
        store: OpLogStore,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let migrator = SchemaMigrator::identity(config.schema.clone())?;
        Ok(Self::with_components(client_id, config, store, state, transport, notifier, migrator, Arc::new(AlwaysValid)))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_components(
        client_id: ClientId,
        config: OpLogConfig,
        store: OpLogStore,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        migrator: SchemaMigrator,
        validator: Arc<dyn StateValidator>,
    ) -> Self {
        let version = config.schema.current_version;
        let tracker = VectorClockTracker::new(store.clone());
        let repairer = Repairer::new(state.clone(), validator, tracker.clone(), client_id.clone(), version);
        let applier = OperationApplier::new(state.clone(), repairer);
        let resolver = ConflictResolver::new(state.clone(), tracker.clone(), applier.clone(), client_id.clone(), version);
        let stale = StaleOpResolver::new(store.clone(), state.clone(), client_id.clone(), version);
        let rejected = RejectedOpsHandler::new(store.clone(), stale, notifier.clone(), config.sync.max_rejected_ops_before_warning);
        let server_migration = ServerMigration::new(state, tracker.clone(), client_id.clone(), version);
        Self {
            client_id,
            config,
            store,
            transport,
            notifier,
            capture_queue: None,
            tracker,
            gate: SchemaGate::new(migrator),
            applier,
            resolver,
            rejected,
            server_migration,
        }
    }

    /// Flush this queue before every upload
    pub fn with_capture_queue(mut self, queue: Arc<CaptureQueue>) -> Self {
        self.capture_queue = Some(queue);
        self
    }

    pub fn client_id(&self) -> &ClientId { &self.client_id }

    /// No snapshot and nothing ever logged
    pub async fn is_wholly_fresh_client(&self) -> Result<bool, OpLogError> {
        Ok(self.store.load_state_cache().await?.is_none() && self.store.get_last_seq().await? == 0)
    }

    pub async fn sync(&self) -> Result<SyncReport, OpLogError> {
        let upload = self.upload_pending_ops().await?;
        let download = self.download_remote_ops(DownloadOptions::default()).await?;

        let needs_follow_up = download.server_migration_handled || download.local_win_ops_created > 0 || upload.local_win_ops_created > 0;
        let follow_up = if needs_follow_up { Some(self.upload_pending_ops().await?) } else { None };

        let repair = {
            let writer = self.store.writer().await?;
            self.applier.repairer().validate_and_repair(&writer, ValidationContext::SyncCycle).await?
        };
        action_info!("SyncOrchestrator", "sync", "{} up, {} down", upload.uploaded, download.new_ops);
        Ok(SyncReport { upload, download, follow_up, repair })
    }

    pub async fn upload_pending_ops(&self) -> Result<UploadOutcome, OpLogError> {
        if let Some(queue) = &self.capture_queue {
            flush_pending_writes(queue, &self.store, &self.config.capture).await?;
        }
        if self.is_wholly_fresh_client().await? {
            warn!("upload blocked: this client has no history yet; download first");
            return Ok(UploadOutcome { blocked_fresh_client: true, ..Default::default() });
        }

        let _upload = self.store.upload_lock().await?;
        let mut outcome = UploadOutcome::default();
        outcome.server_migration = self.server_migration.check_and_handle(&self.store, self.transport.as_ref()).await?;

        let unsynced = self.store.get_unsynced().await?;
        if unsynced.is_empty() {
            return Ok(outcome);
        }
        outcome.uploaded = unsynced.len();

        let sent = self.send(unsynced).await?;
        let accepted_seqs: Vec<u64> = sent.results.iter().filter(|r| r.accepted).filter_map(|r| sent.seq_of(&r.op_id)).collect();
        outcome.accepted = accepted_seqs.len();
        outcome.rejected = sent.results.len() - accepted_seqs.len();
        outcome.piggybacked = sent.piggybacked.len();
        self.store.writer().await?.mark_synced(&accepted_seqs).await?;
        action_debug!("SyncOrchestrator", "uploaded", "{} accepted, {} rejected, {} piggybacked", outcome.accepted, outcome.rejected, outcome.piggybacked);

        // piggybacked ops first, while the rejected local ops are still pending and can surface as
        // conflicts; rejections are handled whatever happens
        let processed = match sent.piggybacked.is_empty() {
            true => Ok(ProcessOutcome::default()),
            false => self.process_remote_ops(sent.piggybacked).await,
        };
        let handled = self.rejected.handle_rejected_ops(&sent.results, self).await;

        let processed = processed?;
        outcome.local_win_ops_created = processed.local_win_ops_created + handled?;
        if sent.latest_seq > self.store.last_server_seq().await? && sent.watermark_safe {
            self.store.writer().await?.set_last_server_seq(sent.latest_seq).await?;
        }
        Ok(outcome)
    }

    /// Upload in log order: regular ops batched, full-state ops through `upload_snapshot`
    async fn send(&self, unsynced: Vec<OperationLogEntry>) -> Result<SentBatch, OpLogError> {
        let mut sent = SentBatch { seqs: unsynced.iter().map(|e| (e.op.id, e.seq)).collect(), ..Default::default() };
        let known_seq = self.store.last_server_seq().await?;
        sent.watermark_safe = true;

        let mut batch: Vec<Operation> = Vec::new();
        for entry in unsynced {
            if !entry.op.is_full_state() {
                batch.push(entry.op);
                continue;
            }
            self.send_batch(&mut sent, std::mem::take(&mut batch), known_seq).await?;
            let reason = match entry.op.op_type {
                OpType::Repair => SnapshotReason::Recovery,
                _ if entry.op.action_type == SERVER_MIGRATION_ACTION => SnapshotReason::Migration,
                _ => SnapshotReason::Initial,
            };
            let result = self.transport.upload_snapshot(SnapshotUpload::from_operation(entry.op, reason)).await?;
            if let Some(seq) = result.server_seq {
                // a snapshot accepted past ops we have not downloaded must not move the watermark over them
                sent.watermark_safe &= seq == known_seq.max(sent.latest_seq) + 1;
                sent.latest_seq = sent.latest_seq.max(seq);
            }
            sent.results.push(result);
        }
        self.send_batch(&mut sent, batch, known_seq).await?;
        Ok(sent)
    }

    async fn send_batch(&self, sent: &mut SentBatch, ops: Vec<Operation>, known_seq: u64) -> Result<(), OpLogError> {
        if ops.is_empty() {
            return Ok(());
        }
        let request = UploadRequest { ops, client_id: self.client_id.clone(), last_known_server_seq: known_seq.max(sent.latest_seq) };
        let response = self.transport.upload_ops(request).await?;
        sent.latest_seq = sent.latest_seq.max(response.latest_seq);
        sent.results.extend(response.results);
        sent.piggybacked.extend(response.piggybacked_ops);
        Ok(())
    }

    pub async fn download_remote_ops(&self, options: DownloadOptions) -> Result<DownloadOutcome, OpLogError> {
        let mut since = if options.force_from_seq0 { 0 } else { self.store.last_server_seq().await? };
        let mut outcome = DownloadOutcome::default();
        let mut downloaded: Vec<Operation> = Vec::new();
        let mut restarted = false;

        loop {
            let request = DownloadRequest { since_seq: since, exclude_client_id: Some(self.client_id.clone()), limit: self.config.sync.download_page_size };
            let page = self.transport.download_ops(request).await?;

            if page.gap_detected {
                if page.latest_seq == 0 {
                    return self.handle_wiped_server().await;
                }
                if !restarted {
                    warn!("server history gap after seq {}; re-downloading from 0", since);
                    restarted = true;
                    since = 0;
                    downloaded.clear();
                    outcome.all_op_clocks.clear();
                    continue;
                }
            }

            outcome.latest_seq = page.latest_seq;
            if page.snapshot_vector_clock.is_some() {
                outcome.snapshot_vector_clock = page.snapshot_vector_clock;
            }
            let page_len = page.ops.len();
            for server_op in page.ops {
                since = since.max(server_op.server_seq);
                if options.force_from_seq0 {
                    outcome.all_op_clocks.push(server_op.op.vector_clock.clone());
                }
                downloaded.push(server_op.op);
            }
            if !page.has_more || page_len == 0 {
                break;
            }
        }

        let fresh_ops = self.store.filter_new_ops(downloaded).await?;
        outcome.new_ops = fresh_ops.len();
        if fresh_ops.is_empty() {
            debug!("no new remote ops");
            self.store.writer().await?.set_last_server_seq(outcome.latest_seq).await?;
            return Ok(outcome);
        }

        if self.is_wholly_fresh_client().await? {
            info!("fresh client about to accept {} remote op(s); asking for confirmation", fresh_ops.len());
            if !self.notifier.confirm_fresh_client_sync(fresh_ops.len()).await {
                self.notifier.notify(Notice::FreshClientSyncCancelled { op_count: fresh_ops.len() });
                return Ok(DownloadOutcome { cancelled: true, ..Default::default() });
            }
        }

        let processed = self.process_remote_ops(fresh_ops).await?;
        outcome.local_win_ops_created = processed.local_win_ops_created;
        // only after the ops are durably logged: a crash before this re-downloads rather than loses them
        self.store.writer().await?.set_last_server_seq(outcome.latest_seq).await?;
        Ok(outcome)
    }

    async fn handle_wiped_server(&self) -> Result<DownloadOutcome, OpLogError> {
        action_warn!("SyncOrchestrator", "server migration", "server has no history; seeding it with local state");
        let writer = self.store.writer().await?;
        let import = self.server_migration.handle_server_migration(&writer).await?;
        writer.set_last_server_seq(0).await?;
        Ok(DownloadOutcome { server_migration_handled: import.is_some(), ..Default::default() })
    }

    /// Gate, filter, detect, resolve and apply a batch of remote ops, then validate
    pub async fn process_remote_ops(&self, ops: Vec<Operation>) -> Result<ProcessOutcome, OpLogError> {
        let mut outcome = ProcessOutcome::default();
        let gated = self.gate.apply(ops).map_err(|e| self.notify_migration_error(e))?;
        if let Some(found) = gated.newer_version {
            self.notifier.notify(Notice::NewerVersionAvailable { found, current: self.config.schema.current_version });
        }
        if !gated.dropped_entities.is_empty() {
            warn!("migration dropped ops for {} entit(ies); dependent ops may fail", gated.dropped_entities.len());
        }
        outcome.dropped_by_migration = gated.dropped_entities.len();

        let latest_import = self.store.latest_full_state_op().await?;
        let filtered = filter_ops_invalidated_by_import(gated.ops, latest_import.as_ref());
        outcome.invalidated_by_import = filtered.invalidated.len();

        let writer = self.store.writer().await?;
        let result = self.apply_segments(&writer, filtered.kept, &mut outcome).await;
        if let Err(OpLogError::PartialApply { applied, remaining, cause, .. }) = &result {
            self.notifier.notify(Notice::PartialApplyFailure { applied: *applied, failed: remaining + 1, reason: cause.to_string() });
        }
        result?;

        self.applier.repairer().validate_and_repair(&writer, ValidationContext::RemoteBatch).await?;
        if outcome.conflicts > 0 {
            self.notifier.notify(Notice::ConflictsAutoResolved { count: outcome.conflicts });
        }
        Ok(outcome)
    }

    /// Full-state ops bypass conflict detection; the regular ops between them are detected and
    /// resolved as one segment each
    async fn apply_segments(&self, writer: &OpLogWriter<'_>, ops: Vec<Operation>, outcome: &mut ProcessOutcome) -> Result<(), OpLogError> {
        let mut segment: Vec<Operation> = Vec::new();
        for op in ops {
            if !op.is_full_state() {
                segment.push(op);
                continue;
            }
            self.apply_regular(writer, std::mem::take(&mut segment), outcome).await?;
            info!("applying full-state {} {:#} from {}", op.op_type, op.id, op.client_id);
            outcome.applied += self.applier.apply_remote_ops(writer, vec![op]).await?.applied;
        }
        self.apply_regular(writer, segment, outcome).await
    }

    async fn apply_regular(&self, writer: &OpLogWriter<'_>, ops: Vec<Operation>, outcome: &mut ProcessOutcome) -> Result<(), OpLogError> {
        if ops.is_empty() {
            return Ok(());
        }
        let ctx = DetectionContext {
            applied_frontier: self.tracker.entity_frontier().await?,
            pending_by_entity: writer.get_unsynced_by_entity().await?,
            snapshot_clock: self.tracker.snapshot_clock().await?,
            snapshot_entity_keys: self.tracker.snapshot_entity_keys().await?,
        };
        let result = detect_conflicts(ops, &ctx);
        outcome.skipped += result.skipped.len();
        for (op, reason) in &result.skipped {
            debug!("skipping remote op {:#}: {:?}", op.id, reason);
        }

        if result.conflicts.is_empty() {
            outcome.applied += self.applier.apply_remote_ops(writer, result.non_conflicting).await?.applied;
            return Ok(());
        }
        outcome.conflicts += result.conflicts.len();
        let report = self.resolver.resolve_conflicts(writer, result.conflicts, result.non_conflicting).await?;
        outcome.applied += report.applied.applied;
        outcome.local_win_ops_created += report.local_win_ops_created;
        Ok(())
    }

    fn notify_migration_error(&self, error: MigrationError) -> OpLogError {
        match &error {
            MigrationError::VersionTooOld { found, min } => self.notifier.notify(Notice::VersionTooOld { found: *found, min: *min }),
            MigrationError::VersionUnsupported { found, current } => self.notifier.notify(Notice::UpdateRequired { found: *found, current: *current }),
            _ => {}
        }
        error.into()
    }
}

#[async_trait]
impl DownloadHandle for SyncOrchestrator {
    async fn download(&self, options: DownloadOptions) -> Result<DownloadOutcome, OpLogError> { self.download_remote_ops(options).await }
}

#[derive(Default)]
struct SentBatch {
    seqs: Vec<(OpId, u64)>,
    results: Vec<OpUploadResult>,
    piggybacked: Vec<Operation>,
    latest_seq: u64,
    /// Whether `latest_seq` may become the download watermark without skipping unseen ops
    watermark_safe: bool,
}

impl SentBatch {
    fn seq_of(&self, op_id: &OpId) -> Option<u64> { self.seqs.iter().find(|(id, _)| id == op_id).map(|(_, seq)| *seq) }
}
