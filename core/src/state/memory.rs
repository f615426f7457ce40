use std::sync::RwLock;

use async_trait::async_trait;
use oplog_proto::Operation;
use serde_json::Value;

use super::{AppState, ApplyOutcome, StateStore};
use crate::error::StateError;

/// Reference [`StateStore`] holding an [`AppState`] in memory.
#[derive(Default)]
pub struct MemoryStateStore {
    state: RwLock<AppState>,
}

impl MemoryStateStore {
    pub fn new(state: AppState) -> Self { Self { state: RwLock::new(state) } }

    pub fn snapshot(&self) -> Result<AppState, StateError> { Ok(self.read()?.clone()) }

    /// Run a local mutation, returning the states before and after it for capture
    pub fn mutate(&self, f: impl FnOnce(&mut AppState)) -> Result<(AppState, AppState), StateError> {
        let mut state = self.write()?;
        let before = state.clone();
        f(&mut state);
        Ok((before, state.clone()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, AppState>, StateError> {
        self.state.read().map_err(|_| StateError::Other("state lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, AppState>, StateError> {
        self.state.write().map_err(|_| StateError::Other("state lock poisoned".into()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn full_state(&self) -> Result<AppState, StateError> { self.snapshot() }

    async fn apply_operations(&self, ops: &[Operation]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut state = match self.write() {
            Ok(state) => state,
            Err(e) => {
                outcome.failed = ops.first().map(|op| (op.clone(), e));
                return outcome;
            }
        };
        for op in ops {
            match state.apply_operation(op) {
                Ok(()) => outcome.applied.push(op.clone()),
                Err(e) => {
                    outcome.failed = Some((op.clone(), e));
                    break;
                }
            }
        }
        outcome
    }

    async fn entity_state(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>, StateError> {
        Ok(self.read()?.entity(entity_type, entity_id).map(|v| v.as_ref().clone()))
    }

    async fn load_state(&self, state: AppState) -> Result<(), StateError> {
        *self.write()? = state;
        Ok(())
    }
}
