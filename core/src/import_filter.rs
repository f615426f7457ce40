use oplog_proto::{ClockOrdering, OpId, Operation};
use tracing::info;

#[derive(Debug, Default)]
pub struct ImportFilterResult {
    pub kept: Vec<Operation>,
    /// Ops superseded by a full-state import; they refer to entities that may no longer exist
    pub invalidated: Vec<Operation>,
    /// The import the batch was filtered against
    pub import: Option<OpId>,
}

/// Drop ops that a full-state import has made meaningless.
///
/// The reference import is the latest full-state op among `ops` and `latest_local_import` (ids
/// are time-ordered). Every regular op from another client whose clock is concurrent with,
/// equal to, or dominated by the import's clock is removed: that client authored it without
/// having seen the import.
pub fn filter_ops_invalidated_by_import(ops: Vec<Operation>, latest_local_import: Option<&Operation>) -> ImportFilterResult {
    let import = ops.iter().filter(|op| op.is_full_state()).chain(latest_local_import).max_by_key(|op| op.id).cloned();
    let Some(import) = import else {
        return ImportFilterResult { kept: ops, ..Default::default() };
    };

    let (kept, invalidated): (Vec<Operation>, Vec<Operation>) = ops.into_iter().partition(|op| {
        op.is_full_state()
            || op.client_id == import.client_id
            || !matches!(op.vector_clock.compare(&import.vector_clock), ClockOrdering::Concurrent | ClockOrdering::Equal | ClockOrdering::LessThan)
    });
    if !invalidated.is_empty() {
        info!("dropped {} op(s) invalidated by import {:#}", invalidated.len(), import.id);
    }
    ImportFilterResult { kept, invalidated, import: Some(import.id) }
}
