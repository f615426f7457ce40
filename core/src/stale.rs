use std::collections::BTreeMap;
use std::sync::Arc;

use oplog_proto::{ClientId, EntityKey, OpId, OpSource, OpType, Operation, VectorClock};
use tracing::{debug, warn};

use crate::{
    action_info,
    clock_tracker::VectorClockTracker,
    error::OpLogError,
    state::{StateStore, LWW_UPDATE_ACTION},
    store::{AppendOptions, OpLogStore},
};

/// Rebuilds local ops the server refused as stale into fresh ops that dominate every clock known.
#[derive(Clone)]
pub struct StaleOpResolver {
    store: OpLogStore,
    state: Arc<dyn StateStore>,
    tracker: VectorClockTracker,
    client_id: ClientId,
    schema_version: u32,
}

impl StaleOpResolver {
    pub fn new(store: OpLogStore, state: Arc<dyn StateStore>, client_id: ClientId, schema_version: u32) -> Self {
        Self { tracker: VectorClockTracker::new(store.clone()), store, state, client_id, schema_version }
    }

    /// Replace `stale` ops with one new op per entity and return how many were created.
    ///
    /// The new clock merges the global clock, `snapshot_clock`, `extra_clocks` and every stale
    /// op clock, then increments this client. Each new op keeps the latest timestamp among the
    /// ops it replaces. Stale ops on entities that no longer exist are simply rejected.
    pub async fn resolve_stale_local_ops(
        &self,
        stale: Vec<Operation>,
        extra_clocks: Vec<VectorClock>,
        snapshot_clock: Option<VectorClock>,
    ) -> Result<usize, OpLogError> {
        if stale.is_empty() {
            return Ok(0);
        }
        let writer = self.store.writer().await?;

        let mut clock = self.tracker.current_vector_clock().await?;
        if let Some(snapshot_clock) = &snapshot_clock {
            clock.merge(snapshot_clock);
        }
        for extra in &extra_clocks {
            clock.merge(extra);
        }
        for op in &stale {
            clock.merge(&op.vector_clock);
        }

        let mut by_entity: BTreeMap<EntityKey, Vec<Operation>> = BTreeMap::new();
        for op in stale {
            match op.primary_entity_key() {
                Some(key) => by_entity.entry(key).or_default().push(op),
                None => {
                    warn!("stale op {:#} names no entity; rejecting", op.id);
                    writer.mark_rejected(&[op.id]).await?;
                }
            }
        }

        let mut created = 0;
        for (key, ops) in by_entity {
            let old_ids: Vec<OpId> = ops.iter().map(|op| op.id).collect();
            let Some(entity) = self.state.entity_state(key.entity_type(), key.entity_id()).await? else {
                debug!("{} no longer exists; rejecting {} stale op(s)", key, old_ids.len());
                writer.mark_rejected(&old_ids).await?;
                continue;
            };

            clock.increment(&self.client_id);
            let timestamp = ops.iter().map(|op| op.timestamp).max().unwrap_or_default();
            let op = Operation {
                id: OpId::new(),
                client_id: self.client_id.clone(),
                action_type: LWW_UPDATE_ACTION.to_string(),
                op_type: OpType::Update,
                entity_type: key.entity_type().to_string(),
                entity_id: Some(key.entity_id().to_string()),
                entity_ids: None,
                payload: entity,
                vector_clock: clock.clone(),
                timestamp,
                schema_version: self.schema_version,
            };
            writer.mark_rejected(&old_ids).await?;
            writer.append(op, OpSource::Local, AppendOptions::default()).await?;
            created += 1;
        }

        action_info!("StaleOpResolver", "resolved", "{} replacement op(s) created", created);
        Ok(created)
    }
}
