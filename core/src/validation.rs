use std::sync::Arc;

use async_trait::async_trait;
use oplog_proto::{now_ms, ClientId, OpId, OpSource, OpType, Operation, ALL_ENTITY_TYPE};
use tracing::{error, info};

use crate::{
    clock_tracker::VectorClockTracker,
    error::{OpLogError, StateError, StorageError},
    state::{AppState, StateStore},
    store::{AppendOptions, OpLogWriter},
};

pub const REPAIR_ACTION: &str = "[OpLog] Repair";

/// Where validation was triggered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationContext {
    PartialApply,
    RemoteBatch,
    Hydration,
    /// End of a full sync cycle, including upload-only cycles
    SyncCycle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid,
    /// The state was invalid; this is the corrected version
    Repaired(AppState),
    Unrepairable(String),
}

/// Application-specific integrity checks over the full state
#[async_trait]
pub trait StateValidator: Send + Sync {
    async fn validate(&self, state: &AppState, context: ValidationContext) -> Result<ValidationOutcome, StateError>;
}

#[derive(Debug, Default, Clone)]
pub struct AlwaysValid;

#[async_trait]
impl StateValidator for AlwaysValid {
    async fn validate(&self, _state: &AppState, _context: ValidationContext) -> Result<ValidationOutcome, StateError> { Ok(ValidationOutcome::Valid) }
}

/// Runs the validator and, when it repairs, loads the result and logs a `Repair` op so every other
/// replica converges on the same state.
#[derive(Clone)]
pub struct Repairer {
    state: Arc<dyn StateStore>,
    validator: Arc<dyn StateValidator>,
    tracker: VectorClockTracker,
    client_id: ClientId,
    schema_version: u32,
}

impl Repairer {
    pub fn new(
        state: Arc<dyn StateStore>,
        validator: Arc<dyn StateValidator>,
        tracker: VectorClockTracker,
        client_id: ClientId,
        schema_version: u32,
    ) -> Self {
        Self { state, validator, tracker, client_id, schema_version }
    }

    /// Returns the id of the `Repair` op if one was created
    pub async fn validate_and_repair(&self, writer: &OpLogWriter<'_>, context: ValidationContext) -> Result<Option<OpId>, OpLogError> {
        let state = self.state.full_state().await?;
        match self.validator.validate(&state, context).await? {
            ValidationOutcome::Valid => Ok(None),
            ValidationOutcome::Unrepairable(reason) => {
                error!("state failed validation ({:?}) and could not be repaired: {}", context, reason);
                Ok(None)
            }
            ValidationOutcome::Repaired(repaired) => {
                let payload = repaired.to_value().map_err(StorageError::from)?;
                self.state.load_state(repaired).await?;
                let op = Operation {
                    id: OpId::new(),
                    client_id: self.client_id.clone(),
                    action_type: REPAIR_ACTION.to_string(),
                    op_type: OpType::Repair,
                    entity_type: ALL_ENTITY_TYPE.to_string(),
                    entity_id: None,
                    entity_ids: None,
                    payload,
                    vector_clock: self.tracker.next_clock(&self.client_id).await?,
                    timestamp: now_ms(),
                    schema_version: self.schema_version,
                };
                let id = op.id;
                writer.append(op, OpSource::Local, AppendOptions::default()).await?;
                info!("state repaired after {:?}; logged repair op {:#}", context, id);
                Ok(Some(id))
            }
        }
    }
}
