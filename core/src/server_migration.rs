use std::sync::Arc;

use oplog_proto::{now_ms, ClientId, DownloadRequest, OpId, OpSource, OpType, Operation, ALL_ENTITY_TYPE};
use tracing::debug;

use crate::{
    action_info,
    clock_tracker::VectorClockTracker,
    error::{OpLogError, StorageError},
    state::StateStore,
    store::{AppendOptions, OpLogStore, OpLogWriter},
    transport::Transport,
};

pub const SERVER_MIGRATION_ACTION: &str = "[OpLog] Server Migration";

/// Seeds an empty server with this client's full state.
///
/// A client that has synced before but finds a server with no history (a new or wiped server)
/// would otherwise upload only its recent unsynced ops, leaving everyone else without the base
/// state those ops build on.
#[derive(Clone)]
pub struct ServerMigration {
    state: Arc<dyn StateStore>,
    tracker: VectorClockTracker,
    client_id: ClientId,
    schema_version: u32,
}

impl ServerMigration {
    pub fn new(state: Arc<dyn StateStore>, tracker: VectorClockTracker, client_id: ClientId, schema_version: u32) -> Self {
        Self { state, tracker, client_id, schema_version }
    }

    /// Pre-upload check. The server is asked for its latest seq without holding the log lock;
    /// the local conditions are checked again under the lock before the import is appended.
    pub async fn check_and_handle(&self, store: &OpLogStore, transport: &dyn Transport) -> Result<Option<OpId>, OpLogError> {
        if !self.local_conditions_hold(store).await? {
            return Ok(None);
        }
        let latest = transport.download_ops(DownloadRequest { since_seq: 0, exclude_client_id: None, limit: 1 }).await?;
        if latest.latest_seq != 0 {
            return Ok(None);
        }
        let writer = store.writer().await?;
        // the log may have moved on while the server was being asked
        if !self.local_conditions_hold(&writer).await? {
            return Ok(None);
        }
        self.handle_server_migration(&writer).await
    }

    /// Never seen a server seq, has synced before, and no full-state op already queued
    async fn local_conditions_hold(&self, store: &OpLogStore) -> Result<bool, OpLogError> {
        if store.last_server_seq().await? != 0 {
            return Ok(false);
        }
        if store.get_unsynced().await?.iter().any(|e| e.op.is_full_state()) {
            debug!("a full-state op is already queued for upload");
            return Ok(false);
        }
        if !store.has_synced_ops().await? {
            debug!("this client never synced; nothing to migrate");
            return Ok(false);
        }
        Ok(true)
    }

    /// Append a `SyncImport` of the full local state. Skipped when there is no state to seed.
    pub async fn handle_server_migration(&self, writer: &OpLogWriter<'_>) -> Result<Option<OpId>, OpLogError> {
        let state = self.state.full_state().await?;
        if state.is_empty() {
            debug!("server migration skipped: local state is empty");
            return Ok(None);
        }
        let op = Operation {
            id: OpId::new(),
            client_id: self.client_id.clone(),
            action_type: SERVER_MIGRATION_ACTION.to_string(),
            op_type: OpType::SyncImport,
            entity_type: ALL_ENTITY_TYPE.to_string(),
            entity_id: None,
            entity_ids: None,
            payload: state.to_value().map_err(StorageError::from)?,
            vector_clock: self.tracker.next_clock(&self.client_id).await?,
            timestamp: now_ms(),
            schema_version: self.schema_version,
        };
        let id = op.id;
        writer.append(op, OpSource::Local, AppendOptions::default()).await?;
        action_info!("ServerMigration", "seeded", "full-state import {:#} queued for upload", id);
        Ok(Some(id))
    }
}
