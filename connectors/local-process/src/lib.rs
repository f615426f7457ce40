//! An in-process sync server, for wiring several clients together inside one process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use oplog_core::{error::TransportError, transport::Transport};
use oplog_proto::{
    ClientId, ClockOrdering, DownloadRequest, DownloadResponse, OpId, OpUploadResult, Operation, RejectionCode, ServerOperation, SnapshotUpload,
    UploadRequest, UploadResponse, VectorClock,
};
use tracing::{debug, info};

/// Ordered server-side log with per-entity causal checks.
///
/// An uploaded op is refused with `CONFLICT_CONCURRENT` when the server holds a concurrent op for one
/// of its entities from another client, and with `CONFLICT_STALE` when a held op already dominates
/// it. Only ops after the latest full-state op are checked; the import superseded everything
/// before it.
#[derive(Default)]
pub struct LocalSyncServer {
    inner: Mutex<ServerLog>,
}

#[derive(Default)]
struct ServerLog {
    ops: Vec<ServerOperation>,
    latest_seq: u64,
    injected: HashMap<OpId, RejectionCode>,
}

impl ServerLog {
    fn find(&self, op_id: &OpId) -> Option<&ServerOperation> { self.ops.iter().find(|s| s.op.id == *op_id) }

    fn since_latest_import(&self) -> &[ServerOperation] {
        match self.ops.iter().rposition(|s| s.op.is_full_state()) {
            Some(i) => &self.ops[i + 1..],
            None => &self.ops,
        }
    }

    fn snapshot_clock(&self) -> Option<VectorClock> { self.ops.iter().rev().find(|s| s.op.is_full_state()).map(|s| s.op.vector_clock.clone()) }

    fn check(&self, op: &Operation) -> Option<RejectionCode> {
        if op.is_full_state() {
            return None;
        }
        let keys = op.entity_keys();
        let mut verdict = None;
        for held in self.since_latest_import() {
            if held.op.is_full_state() || !held.op.entity_keys().iter().any(|k| keys.contains(k)) {
                continue;
            }
            match held.op.vector_clock.compare(&op.vector_clock) {
                ClockOrdering::Concurrent if held.op.client_id != op.client_id => return Some(RejectionCode::ConflictConcurrent),
                ClockOrdering::GreaterThan | ClockOrdering::Equal => verdict = Some(RejectionCode::ConflictStale),
                _ => {}
            }
        }
        verdict
    }

    fn push(&mut self, op: Operation) -> u64 {
        self.latest_seq += 1;
        self.ops.push(ServerOperation { server_seq: self.latest_seq, op });
        self.latest_seq
    }

    fn accept(&mut self, op: Operation) -> OpUploadResult {
        if let Some(held) = self.find(&op.id) {
            // re-upload after a lost response
            return OpUploadResult::accepted(op.id, held.server_seq);
        }
        if let Some(code) = self.injected.remove(&op.id) {
            return OpUploadResult::rejected(op.id, code, "injected rejection");
        }
        if let Some(code) = self.check(&op) {
            debug!("server rejects {:#} from {}: {:?}", op.id, op.client_id, code);
            return OpUploadResult::rejected(op.id, code, "conflicts with a held operation");
        }
        let id = op.id;
        OpUploadResult::accepted(id, self.push(op))
    }
}

impl LocalSyncServer {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn log(&self) -> Result<MutexGuard<'_, ServerLog>, TransportError> {
        self.inner.lock().map_err(|_| TransportError::Unavailable("server log lock poisoned".into()))
    }

    /// Wipe the server, as if it were replaced by a fresh instance
    pub fn reset(&self) -> Result<(), TransportError> {
        let mut log = self.log()?;
        info!("local sync server reset; {} op(s) discarded", log.ops.len());
        *log = ServerLog::default();
        Ok(())
    }

    /// Refuse the next upload of `op_id` with `code`
    pub fn inject_rejection(&self, op_id: OpId, code: RejectionCode) -> Result<(), TransportError> {
        self.log()?.injected.insert(op_id, code);
        Ok(())
    }

    pub fn ops(&self) -> Result<Vec<ServerOperation>, TransportError> { Ok(self.log()?.ops.clone()) }

    pub fn latest_seq(&self) -> Result<u64, TransportError> { Ok(self.log()?.latest_seq) }

    pub fn upload(&self, request: UploadRequest) -> Result<UploadResponse, TransportError> {
        let mut log = self.log()?;
        let uploaded: HashSet<OpId> = request.ops.iter().map(|op| op.id).collect();
        let results: Vec<OpUploadResult> = request.ops.into_iter().map(|op| log.accept(op)).collect();

        let piggybacked_ops = log
            .ops
            .iter()
            .filter(|s| s.server_seq > request.last_known_server_seq && s.op.client_id != request.client_id && !uploaded.contains(&s.op.id))
            .map(|s| s.op.clone())
            .collect();
        Ok(UploadResponse { results, piggybacked_ops, latest_seq: log.latest_seq })
    }

    pub fn download(&self, request: DownloadRequest) -> Result<DownloadResponse, TransportError> {
        let log = self.log()?;
        let gap_detected = request.since_seq > log.latest_seq;
        let mut matching = log
            .ops
            .iter()
            .filter(|s| s.server_seq > request.since_seq && Some(&s.op.client_id) != request.exclude_client_id.as_ref())
            .cloned();
        let ops: Vec<ServerOperation> = matching.by_ref().take(request.limit.max(1)).collect();
        let has_more = matching.next().is_some();
        Ok(DownloadResponse { ops, has_more, latest_seq: log.latest_seq, gap_detected, snapshot_vector_clock: log.snapshot_clock() })
    }

    pub fn snapshot(&self, snapshot: SnapshotUpload) -> Result<OpUploadResult, TransportError> {
        info!("server received {:?} snapshot {:#} from {}", snapshot.reason, snapshot.op_id, snapshot.client_id);
        Ok(self.log()?.accept(snapshot.into_operation()))
    }
}

/// A client's handle on a [`LocalSyncServer`]
pub struct LocalProcessTransport {
    server: Arc<LocalSyncServer>,
    client_id: ClientId,
    offline: AtomicBool,
}

impl LocalProcessTransport {
    pub fn new(server: Arc<LocalSyncServer>, client_id: ClientId) -> Arc<Self> { Arc::new(Self { server, client_id, offline: AtomicBool::new(false) }) }

    /// While offline every call fails with [`TransportError::Unavailable`]
    pub fn set_offline(&self, offline: bool) { self.offline.store(offline, Ordering::SeqCst); }

    fn online(&self) -> Result<&LocalSyncServer, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(format!("{} is offline", self.client_id)));
        }
        Ok(&self.server)
    }
}

#[async_trait]
impl Transport for LocalProcessTransport {
    async fn upload_ops(&self, request: UploadRequest) -> Result<UploadResponse, TransportError> { self.online()?.upload(request) }

    async fn download_ops(&self, request: DownloadRequest) -> Result<DownloadResponse, TransportError> { self.online()?.download(request) }

    async fn upload_snapshot(&self, snapshot: SnapshotUpload) -> Result<OpUploadResult, TransportError> { self.online()?.snapshot(snapshot) }
}
