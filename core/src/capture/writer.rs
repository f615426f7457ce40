use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use oplog_proto::{now_ms, ClientId, OpId, OpSource, Operation};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{CaptureItem, CaptureQueue, EntityChange};
use crate::{
    action_error, action_info, action_warn,
    clock_tracker::VectorClockTracker,
    compaction::Compactor,
    config::CaptureConfig,
    error::{OpLogError, StorageError},
    notify::{Notice, Notifier},
    store::{AppendOptions, OpLogStore},
    util::OneTimeFlag,
};

/// The single sequential consumer of the capture queue. Turns each captured change into a
/// local operation with a fresh clock and appends it to the log.
pub struct OperationWriter {
    queue: Arc<CaptureQueue>,
    store: OpLogStore,
    tracker: VectorClockTracker,
    client_id: ClientId,
    schema_version: u32,
    compaction_threshold: u64,
    compactor: Option<Compactor>,
    notifier: Option<Arc<dyn Notifier>>,
    stop: OneTimeFlag,
}

impl OperationWriter {
    pub fn new(queue: Arc<CaptureQueue>, store: OpLogStore, client_id: ClientId, schema_version: u32) -> Self {
        Self {
            queue,
            tracker: VectorClockTracker::new(store.clone()),
            store,
            client_id,
            schema_version,
            compaction_threshold: u64::MAX,
            compactor: None,
            notifier: None,
            stop: OneTimeFlag::new(),
        }
    }

    /// Compact once this many ops have been written since the last compaction
    pub fn with_compaction(mut self, compactor: Compactor, threshold: u64) -> Self {
        self.compactor = Some(compactor);
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> { tokio::spawn(async move { self.run().await }) }

    pub fn stop(&self) { self.stop.set(); }

    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                item = self.queue.recv() => {
                    let action = item.action_type.clone();
                    if let Err(e) = self.write_item(item).await {
                        action_error!("OperationWriter", "write failed", "{}: {}", action, e);
                    }
                    self.queue.complete();
                }
            }
        }
        debug!("operation writer stopped");
    }

    /// Append one operation per captured change, then compact if the threshold was reached.
    ///
    /// When storage refuses a write for lack of space, an emergency compaction runs and the
    /// remaining changes are retried once. A second refusal raises
    /// [`Notice::StorageQuotaExceeded`] and returns the error.
    pub async fn write_item(&self, item: CaptureItem) -> Result<Vec<OpId>, OpLogError> {
        let mut changes: VecDeque<EntityChange> = item.changes.into();
        let mut written = Vec::with_capacity(changes.len());
        let counter = match self.append_changes(&item.action_type, &mut changes, &mut written).await {
            Err(OpLogError::Storage(StorageError::QuotaExceeded(reason))) => {
                action_warn!("OperationWriter", "storage quota exceeded", "{} ({} changes left)", reason, changes.len());
                self.retry_after_emergency_compaction(&item.action_type, &mut changes, &mut written, reason).await?
            }
            result => result?,
        };

        if counter >= self.compaction_threshold {
            if let Some(compactor) = &self.compactor {
                action_info!("OperationWriter", "compaction threshold reached", "{} ops", counter);
                if let Err(e) = compactor.compact().await {
                    action_error!("OperationWriter", "compaction failed", "{}", e);
                }
            }
        }
        Ok(written)
    }

    /// Appends from the front of `changes`, popping each one once it is in the log, so a failed
    /// call leaves exactly the unwritten changes behind. Returns the compaction counter.
    async fn append_changes(&self, action_type: &str, changes: &mut VecDeque<EntityChange>, written: &mut Vec<OpId>) -> Result<u64, OpLogError> {
        let writer = self.store.writer().await?;
        let mut clock = self.tracker.current_vector_clock().await?;
        let mut counter = 0;
        while let Some(change) = changes.front() {
            clock.increment(&self.client_id);
            let op = Operation {
                id: OpId::new(),
                client_id: self.client_id.clone(),
                action_type: action_type.to_string(),
                op_type: change.op_type,
                entity_type: change.entity_type.clone(),
                entity_id: Some(change.entity_id.clone()),
                entity_ids: None,
                payload: change.changes.clone(),
                vector_clock: clock.clone(),
                timestamp: now_ms(),
                schema_version: self.schema_version,
            };
            let id = op.id;
            writer.append(op, OpSource::Local, AppendOptions::default()).await?;
            changes.pop_front();
            written.push(id);
            counter = writer.increment_compaction_counter().await?;
        }
        Ok(counter)
    }

    async fn retry_after_emergency_compaction(
        &self,
        action_type: &str,
        changes: &mut VecDeque<EntityChange>,
        written: &mut Vec<OpId>,
        reason: String,
    ) -> Result<u64, OpLogError> {
        let compacted = match &self.compactor {
            Some(compactor) => compactor.emergency_compact().await,
            None => false,
        };
        let result = if compacted {
            self.append_changes(action_type, changes, written).await
        } else {
            Err(StorageError::QuotaExceeded(reason).into())
        };
        if let Err(OpLogError::Storage(StorageError::QuotaExceeded(reason))) = &result {
            action_error!("OperationWriter", "storage still full", "{}: {} changes dropped", reason, changes.len());
            if let Some(notifier) = &self.notifier {
                notifier.notify(Notice::StorageQuotaExceeded);
            }
        }
        result
    }
}

/// Wait until every captured change is durably in the log.
///
/// Polls until the queue is empty with nothing in flight, failing with
/// [`OpLogError::FlushTimeout`] past `config.flush_timeout`. A final acquire and release of the
/// write lock proves the last write transaction has committed.
pub async fn flush_pending_writes(queue: &CaptureQueue, store: &OpLogStore, config: &CaptureConfig) -> Result<(), OpLogError> {
    let deadline = tokio::time::Instant::now() + config.flush_timeout;
    while !queue.is_drained() {
        if tokio::time::Instant::now() >= deadline {
            return Err(OpLogError::FlushTimeout(config.flush_timeout));
        }
        tokio::time::sleep(config.flush_poll_interval.max(Duration::from_millis(1))).await;
    }
    store.barrier().await?;
    Ok(())
}
