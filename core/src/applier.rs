use std::collections::HashMap;
use std::sync::Arc;

use oplog_proto::{OpId, OpSource, Operation};
use tracing::{debug, warn};

use crate::{
    action_debug, action_error,
    error::OpLogError,
    state::StateStore,
    store::{AppendOptions, OpLogWriter},
    validation::{Repairer, ValidationContext},
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyReport {
    pub applied: usize,
    /// Already logged, not applied again
    pub duplicates: usize,
}

/// Applies remote ops with pending → applied bookkeeping so a crash mid-apply can be recovered.
#[derive(Clone)]
pub struct OperationApplier {
    state: Arc<dyn StateStore>,
    repairer: Repairer,
}

impl OperationApplier {
    pub fn new(state: Arc<dyn StateStore>, repairer: Repairer) -> Self { Self { state, repairer } }

    pub fn repairer(&self) -> &Repairer { &self.repairer }

    /// Log `ops` as pending, apply them in one call, then mark the applied ones.
    ///
    /// A batch is not all-or-nothing: on failure the ops before the failed one stay applied, the
    /// failed op and everything after it are marked failed, the state is validated and
    /// [`OpLogError::PartialApply`] is returned.
    pub async fn apply_remote_ops(&self, writer: &OpLogWriter<'_>, ops: Vec<Operation>) -> Result<ApplyReport, OpLogError> {
        let total = ops.len();
        let fresh = writer.filter_new_ops(ops).await?;
        let duplicates = total - fresh.len();
        if fresh.is_empty() {
            return Ok(ApplyReport { applied: 0, duplicates });
        }

        let mut seqs: HashMap<OpId, u64> = HashMap::with_capacity(fresh.len());
        for op in &fresh {
            let seq = writer.append(op.clone(), OpSource::Remote, AppendOptions::pending()).await?;
            seqs.insert(op.id, seq);
        }
        let applied = self.apply_logged(writer, &fresh, &seqs).await?;
        Ok(ApplyReport { applied, duplicates })
    }

    /// Re-apply remote entries still marked pending, e.g. after a crash between logging and applying
    pub async fn recover_pending_remote_ops(&self, writer: &OpLogWriter<'_>) -> Result<usize, OpLogError> {
        let pending = writer.get_pending_remote_ops().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        warn!("recovering {} remote op(s) left pending by an interrupted apply", pending.len());
        let seqs: HashMap<OpId, u64> = pending.iter().map(|e| (e.op.id, e.seq)).collect();
        let ops: Vec<Operation> = pending.into_iter().map(|e| e.op).collect();
        self.apply_logged(writer, &ops, &seqs).await
    }

    async fn apply_logged(&self, writer: &OpLogWriter<'_>, ops: &[Operation], seqs: &HashMap<OpId, u64>) -> Result<usize, OpLogError> {
        let outcome = self.state.apply_operations(ops).await;

        let applied_seqs: Vec<u64> = outcome.applied.iter().filter_map(|op| seqs.get(&op.id).copied()).collect();
        writer.mark_applied(&applied_seqs).await?;
        writer.merge_remote_op_clocks(&outcome.applied).await?;
        action_debug!("OperationApplier", "applied", "{} of {} remote op(s)", outcome.applied.len(), ops.len());

        let Some((failed_op, cause)) = outcome.failed else {
            return Ok(outcome.applied.len());
        };

        let failed_at = ops.iter().position(|op| op.id == failed_op.id).unwrap_or(outcome.applied.len());
        let failed_seqs: Vec<u64> = ops[failed_at..].iter().filter_map(|op| seqs.get(&op.id).copied()).collect();
        writer.mark_failed(&failed_seqs).await?;
        action_error!("OperationApplier", "partial apply", "op {:#} failed: {}; {} op(s) marked failed", failed_op.id, cause, failed_seqs.len());

        if let Err(e) = self.repairer.validate_and_repair(writer, ValidationContext::PartialApply).await {
            debug!("validation after partial apply failed: {}", e);
        }
        Err(OpLogError::PartialApply {
            applied: outcome.applied.len(),
            failed_op: failed_op.id,
            remaining: failed_seqs.len().saturating_sub(1),
            cause,
        })
    }
}
