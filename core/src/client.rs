use std::sync::{Arc, Mutex};

use oplog_proto::ClientId;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    action_info,
    applier::OperationApplier,
    capture::{flush_pending_writes, Intent, OperationCapture, OperationWriter},
    clock_tracker::VectorClockTracker,
    compaction::{CompactionReport, Compactor},
    config::OpLogConfig,
    error::{CompactionError, OpLogError},
    hydrator::{HydrationReport, Hydrator},
    lock::lock_provider_from_config,
    migration::{SchemaMigration, SchemaMigrator},
    notify::Notifier,
    state::{AppState, StateStore},
    storage::OpLogStorage,
    store::OpLogStore,
    sync::{SyncOrchestrator, SyncReport},
    transport::Transport,
    validation::{AlwaysValid, Repairer, StateValidator},
};

/// Everything one replica needs, wired together: capture, the background writer, compaction,
/// hydration and sync.
///
/// Call [`OpLogClient::start`] once before capturing; it rebuilds state from the log and starts the
/// writer task.
pub struct OpLogClient {
    client_id: ClientId,
    config: OpLogConfig,
    store: OpLogStore,
    state: Arc<dyn StateStore>,
    capture: OperationCapture,
    writer: Arc<OperationWriter>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    compactor: Compactor,
    hydrator: Hydrator,
    sync: SyncOrchestrator,
}

impl OpLogClient {
    pub fn new(
        client_id: ClientId,
        config: OpLogConfig,
        storage: Arc<dyn OpLogStorage>,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        Self::with_schema(client_id, config, storage, state, transport, notifier, Vec::new(), Arc::new(AlwaysValid))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_schema(
        client_id: ClientId,
        config: OpLogConfig,
        storage: Arc<dyn OpLogStorage>,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        migrations: Vec<SchemaMigration>,
        validator: Arc<dyn StateValidator>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let migrator = SchemaMigrator::new(config.schema.clone(), migrations)?;
        let version = config.schema.current_version;

        let locks = lock_provider_from_config(&config.lock);
        let store = OpLogStore::new(storage, locks).with_max_apply_retries(config.sync.max_apply_retries);

        let capture = OperationCapture::new(&config.capture);
        let compactor = Compactor::new(store.clone(), state.clone(), config.compaction.clone(), version);
        let writer = OperationWriter::new(capture.queue().clone(), store.clone(), client_id.clone(), version)
            .with_compaction(compactor.clone(), config.compaction.threshold)
            .with_notifier(notifier.clone());

        let repairer = Repairer::new(state.clone(), validator.clone(), VectorClockTracker::new(store.clone()), client_id.clone(), version);
        let hydrator = Hydrator::new(store.clone(), state.clone(), migrator.clone(), OperationApplier::new(state.clone(), repairer));

        let sync = SyncOrchestrator::with_components(client_id.clone(), config.clone(), store.clone(), state.clone(), transport, notifier, migrator, validator)
            .with_capture_queue(capture.queue().clone());

        Ok(Self {
            client_id,
            config,
            store,
            state,
            capture,
            writer: Arc::new(writer),
            writer_task: Mutex::new(None),
            compactor,
            hydrator,
            sync,
        })
    }

    pub fn client_id(&self) -> &ClientId { &self.client_id }

    pub fn store(&self) -> &OpLogStore { &self.store }

    pub fn state(&self) -> &Arc<dyn StateStore> { &self.state }

    pub fn sync_orchestrator(&self) -> &SyncOrchestrator { &self.sync }

    /// Hydrate from the log, then start the background writer
    pub async fn start(&self) -> Result<HydrationReport, OpLogError> {
        let report = self.hydrator.hydrate().await?;
        if let Ok(mut task) = self.writer_task.lock() {
            if task.is_none() {
                *task = Some(self.writer.clone().spawn());
            }
        }
        action_info!("OpLogClient", "started", "{}", self.client_id);
        Ok(report)
    }

    /// Record the entity changes `intent` made between `before` and `after`
    pub fn capture(&self, intent: Intent, before: &AppState, after: &AppState) -> usize { self.capture.capture(intent, before, after) }

    /// Wait until every captured change is in the log
    pub async fn flush(&self) -> Result<(), OpLogError> { flush_pending_writes(self.capture.queue(), &self.store, &self.config.capture).await }

    pub async fn sync(&self) -> Result<SyncReport, OpLogError> { self.sync.sync().await }

    pub async fn compact(&self) -> Result<CompactionReport, CompactionError> { self.compactor.compact().await }

    /// Compact with the short emergency retention, e.g. when local storage is full
    pub async fn emergency_compact(&self) -> bool { self.compactor.emergency_compact().await }

    /// Flush outstanding captures and stop the writer
    pub async fn shutdown(&self) -> Result<(), OpLogError> {
        let flushed = self.flush().await;
        self.writer.stop();
        let task = self.writer_task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("writer task ended abnormally: {}", e);
            }
        }
        flushed
    }
}
