use std::collections::BTreeSet;
use std::sync::Arc;

use oplog_proto::{ClientId, OpId, OpSource, OpType, Operation, VectorClock};
use serde_json::json;
use tracing::debug;

use crate::{
    action_info,
    applier::{ApplyReport, OperationApplier},
    clock_tracker::VectorClockTracker,
    conflict::{lww_winner, EntityConflict, Resolution},
    error::OpLogError,
    state::{StateStore, LWW_UPDATE_ACTION},
    store::{AppendOptions, OpLogWriter},
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResolutionReport {
    /// New local ops created because local won; they need uploading
    pub local_win_ops_created: usize,
    pub remote_wins: usize,
    pub local_wins: usize,
    pub applied: ApplyReport,
}

/// Last-write-wins resolution of entity conflicts.
#[derive(Clone)]
pub struct ConflictResolver {
    state: Arc<dyn StateStore>,
    tracker: VectorClockTracker,
    applier: OperationApplier,
    client_id: ClientId,
    schema_version: u32,
}

impl ConflictResolver {
    pub fn new(state: Arc<dyn StateStore>, tracker: VectorClockTracker, applier: OperationApplier, client_id: ClientId, schema_version: u32) -> Self {
        Self { state, tracker, applier, client_id, schema_version }
    }

    /// Resolve `conflicts` and apply the winning remote ops together with `non_conflicting` in a
    /// single applier pass, winners first, since later ops may depend on entities the
    /// resolution materializes.
    pub async fn resolve_conflicts(
        &self,
        writer: &OpLogWriter<'_>,
        conflicts: Vec<EntityConflict>,
        non_conflicting: Vec<Operation>,
    ) -> Result<ResolutionReport, OpLogError> {
        let mut report = ResolutionReport::default();
        let mut local_wins = Vec::new();
        let mut to_apply: Vec<Operation> = Vec::new();

        for conflict in conflicts {
            match lww_winner(&conflict.local_ops, &conflict.remote_ops) {
                Resolution::Remote => {
                    // reject first so the losing local ops are never uploaded
                    let losing: Vec<OpId> = conflict.local_ops.iter().map(|op| op.id).collect();
                    writer.mark_rejected(&losing).await?;
                    debug!("{}: remote wins, rejected {} local op(s)", conflict.key, losing.len());
                    report.remote_wins += 1;
                    to_apply.extend(conflict.remote_ops);
                }
                Resolution::Local => {
                    report.local_wins += 1;
                    local_wins.push(conflict);
                }
            }
        }

        let losing_remote: BTreeSet<OpId> = local_wins.iter().flat_map(|c| c.remote_ops.iter().map(|op| op.id)).collect();
        if !local_wins.is_empty() {
            report.local_win_ops_created = self.apply_local_wins(writer, &local_wins).await?;
        }

        let mut seen = BTreeSet::new();
        let batch: Vec<Operation> =
            to_apply.into_iter().chain(non_conflicting).filter(|op| !losing_remote.contains(&op.id) && seen.insert(op.id)).collect();
        report.applied = self.applier.apply_remote_ops(writer, batch).await?;

        if report.remote_wins + report.local_wins > 0 {
            action_info!("ConflictResolver", "resolved", "{} remote win(s), {} local win(s)", report.remote_wins, report.local_wins);
        }
        Ok(report)
    }

    /// For each conflict the local side won: keep the losing remote ops on record as rejected,
    /// retire the old local ops and replace them with one op carrying the current entity that
    /// dominates every clock involved.
    async fn apply_local_wins(&self, writer: &OpLogWriter<'_>, conflicts: &[EntityConflict]) -> Result<usize, OpLogError> {
        let mut clock = self.tracker.current_vector_clock().await?;
        for op in conflicts.iter().flat_map(|c| c.local_ops.iter().chain(c.remote_ops.iter())) {
            clock.merge(&op.vector_clock);
        }

        let mut created = 0;
        for conflict in conflicts {
            for remote in &conflict.remote_ops {
                if !writer.has_op(&remote.id).await? {
                    writer.append(remote.clone(), OpSource::Remote, AppendOptions::default()).await?;
                }
            }
            let remote_ids: Vec<OpId> = conflict.remote_ops.iter().map(|op| op.id).collect();
            writer.mark_rejected(&remote_ids).await?;
            let local_ids: Vec<OpId> = conflict.local_ops.iter().map(|op| op.id).collect();
            writer.mark_rejected(&local_ids).await?;

            clock.increment(&self.client_id);
            let op = self.local_win_op(conflict, clock.clone()).await?;
            debug!("{}: local wins, replacing {} local op(s) with {:#}", conflict.key, local_ids.len(), op.id);
            writer.append(op, OpSource::Local, AppendOptions::default()).await?;
            created += 1;
        }
        Ok(created)
    }

    async fn local_win_op(&self, conflict: &EntityConflict, vector_clock: VectorClock) -> Result<Operation, OpLogError> {
        let (entity_type, entity_id) = (conflict.entity_type(), conflict.entity_id());
        let timestamp = conflict.local_ops.iter().map(|op| op.timestamp).max().unwrap_or_else(oplog_proto::now_ms);
        let (op_type, payload) = match self.state.entity_state(entity_type, entity_id).await? {
            Some(entity) => (OpType::Update, entity),
            None => (OpType::Delete, json!({ "id": entity_id })),
        };
        Ok(Operation {
            id: OpId::new(),
            client_id: self.client_id.clone(),
            action_type: LWW_UPDATE_ACTION.to_string(),
            op_type,
            entity_type: entity_type.to_string(),
            entity_id: Some(entity_id.to_string()),
            entity_ids: None,
            payload,
            vector_clock,
            timestamp,
            schema_version: self.schema_version,
        })
    }
}
