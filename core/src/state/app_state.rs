use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use oplog_proto::{EntityKey, OpType, Operation, SINGLETON_ID};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::LWW_UPDATE_ACTION;
use crate::error::StateError;

/// Entities of one type, keyed by id. Unchanged entities keep their `Arc` across updates so
/// capture can skip them by pointer comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitySlice {
    entities: BTreeMap<String, Arc<Value>>,
}

impl EntitySlice {
    pub fn get(&self, id: &str) -> Option<&Arc<Value>> { self.entities.get(id) }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Value>)> { self.entities.iter() }

    pub fn len(&self) -> usize { self.entities.len() }

    pub fn is_empty(&self) -> bool { self.entities.is_empty() }

    pub fn insert(&mut self, id: impl Into<String>, value: Value) { self.entities.insert(id.into(), Arc::new(value)); }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Value>> { self.entities.remove(id) }
}

impl<S: Into<String>> FromIterator<(S, Value)> for EntitySlice {
    fn from_iter<T: IntoIterator<Item = (S, Value)>>(iter: T) -> Self {
        Self { entities: iter.into_iter().map(|(k, v)| (k.into(), Arc::new(v))).collect() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slice {
    /// A collection of entities; the slice name is the entity type
    Entities(EntitySlice),
    /// Single-value feature state, addressed with entity id `*`
    Singleton(Arc<Value>),
}

/// Full application state: named slices behind `Arc`s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppState {
    slices: BTreeMap<String, Arc<Slice>>,
}

impl AppState {
    pub fn new() -> Self { Self::default() }

    pub fn with_entities(mut self, entity_type: &str, slice: EntitySlice) -> Self {
        self.slices.insert(entity_type.to_string(), Arc::new(Slice::Entities(slice)));
        self
    }

    pub fn with_singleton(mut self, name: &str, value: Value) -> Self {
        self.slices.insert(name.to_string(), Arc::new(Slice::Singleton(Arc::new(value))));
        self
    }

    pub fn slice(&self, name: &str) -> Option<&Arc<Slice>> { self.slices.get(name) }

    pub fn slice_names(&self) -> BTreeSet<&String> { self.slices.keys().collect() }

    /// No entities and no non-empty singleton values
    pub fn is_empty(&self) -> bool {
        self.slices.values().all(|slice| match slice.as_ref() {
            Slice::Entities(entities) => entities.is_empty(),
            Slice::Singleton(value) => is_blank(value),
        })
    }

    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<Arc<Value>> {
        match self.slices.get(entity_type)?.as_ref() {
            Slice::Entities(entities) => entities.get(entity_id).cloned(),
            Slice::Singleton(value) if entity_id == SINGLETON_ID && !value.is_null() => Some(value.clone()),
            Slice::Singleton(_) => None,
        }
    }

    /// `"TYPE:id"` for every entity present, singletons as `"NAME:*"`
    pub fn entity_keys(&self) -> BTreeSet<EntityKey> {
        let mut keys = BTreeSet::new();
        for (name, slice) in self.slices.iter() {
            match slice.as_ref() {
                Slice::Entities(entities) => keys.extend(entities.iter().map(|(id, _)| EntityKey::new(name, id))),
                Slice::Singleton(value) if !value.is_null() => {
                    keys.insert(EntityKey::new(name, SINGLETON_ID));
                }
                Slice::Singleton(_) => {}
            }
        }
        keys
    }

    pub fn upsert_entity(&mut self, entity_type: &str, entity_id: &str, value: Value) {
        if entity_id == SINGLETON_ID {
            self.slices.insert(entity_type.to_string(), Arc::new(Slice::Singleton(Arc::new(value))));
            return;
        }
        let slice = self.slices.entry(entity_type.to_string()).or_insert_with(|| Arc::new(Slice::Entities(EntitySlice::default())));
        match Arc::make_mut(slice) {
            Slice::Entities(entities) => entities.insert(entity_id, value),
            other => *other = Slice::Entities(std::iter::once((entity_id, value)).collect()),
        }
    }

    pub fn remove_entity(&mut self, entity_type: &str, entity_id: &str) -> bool {
        let Some(slice) = self.slices.get_mut(entity_type) else { return false };
        if entity_id == SINGLETON_ID {
            let existed = matches!(slice.as_ref(), Slice::Singleton(v) if !v.is_null());
            *slice = Arc::new(Slice::Singleton(Arc::new(Value::Null)));
            return existed;
        }
        match Arc::make_mut(slice) {
            Slice::Entities(entities) => entities.remove(entity_id).is_some(),
            Slice::Singleton(_) => false,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> { serde_json::to_value(self) }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> { serde_json::from_value(value) }

    /// Apply a single operation in place. On error the state is left unchanged.
    pub fn apply_operation(&mut self, op: &Operation) -> Result<(), StateError> {
        if op.is_full_state() {
            let state = AppState::from_value(op.payload.clone()).map_err(|e| invalid(op, e.to_string()))?;
            *self = state;
            return Ok(());
        }

        let ids = op.entity_id_list();
        if ids.is_empty() {
            return Err(invalid(op, "operation names no entity".into()));
        }

        // stage on a copy so a failure part way through a multi-entity op leaves no trace
        let mut next = self.clone();
        for id in ids {
            next.apply_to_entity(op, id)?;
        }
        *self = next;
        Ok(())
    }

    fn apply_to_entity(&mut self, op: &Operation, entity_id: &str) -> Result<(), StateError> {
        match op.op_type {
            OpType::Create => {
                self.upsert_entity(&op.entity_type, entity_id, op.payload.clone());
                Ok(())
            }
            OpType::Update if op.action_type == LWW_UPDATE_ACTION => {
                self.upsert_entity(&op.entity_type, entity_id, op.payload.clone());
                Ok(())
            }
            OpType::Update => {
                let changes = op.payload.as_object().ok_or_else(|| invalid(op, "update payload must be an object".into()))?;
                let existing = self.entity(&op.entity_type, entity_id);
                let base = match existing {
                    Some(value) => value.as_ref().clone(),
                    None if entity_id == SINGLETON_ID => Value::Object(Map::new()),
                    None => return Err(StateError::EntityNotFound(EntityKey::new(&op.entity_type, entity_id).to_string())),
                };
                self.upsert_entity(&op.entity_type, entity_id, merge_fields(base, changes));
                Ok(())
            }
            OpType::Delete => {
                self.remove_entity(&op.entity_type, entity_id);
                Ok(())
            }
            OpType::SyncImport | OpType::BackupImport | OpType::Repair => Err(invalid(op, "full-state op routed to entity apply".into())),
        }
    }
}

/// Shallow merge; a `null` change removes the field
fn merge_fields(base: Value, changes: &Map<String, Value>) -> Value {
    let mut object = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (field, value) in changes {
        if value.is_null() {
            object.remove(field);
        } else {
            object.insert(field.clone(), value.clone());
        }
    }
    Value::Object(object)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn invalid(op: &Operation, reason: String) -> StateError { StateError::InvalidPayload { op_id: op.id, reason } }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::op;
    use serde_json::json;

    fn tasks() -> AppState {
        AppState::new()
            .with_entities("TASK", [("t1", json!({"id": "t1", "title": "a", "done": false}))].into_iter().collect())
            .with_singleton("GLOBAL_CONFIG", json!({"theme": "dark"}))
    }

    #[test]
    fn entity_keys_include_singletons() {
        let keys: Vec<String> = tasks().entity_keys().into_iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["GLOBAL_CONFIG:*", "TASK:t1"]);
    }

    #[test]
    fn sparse_update_merges_and_null_removes() {
        let mut state = tasks();
        let mut update = op("A", OpType::Update, "TASK", "t1", [("A", 1)]);
        update.payload = json!({"title": "b", "done": null});
        state.apply_operation(&update).unwrap();
        assert_eq!(*state.entity("TASK", "t1").unwrap(), json!({"id": "t1", "title": "b"}));
    }

    #[test]
    fn sparse_update_of_missing_entity_fails_without_side_effects() {
        let mut state = tasks();
        let mut update = op("A", OpType::Update, "TASK", "t1", [("A", 1)]);
        update.entity_ids = Some(vec!["t1".into(), "missing".into()]);
        update.payload = json!({"title": "z"});
        let before = state.clone();
        assert!(matches!(state.apply_operation(&update), Err(StateError::EntityNotFound(_))));
        assert_eq!(state, before);
    }

    #[test]
    fn lww_update_upserts_whole_entity() {
        let mut state = AppState::new();
        let mut update = op("A", OpType::Update, "TASK", "t9", [("A", 1)]);
        update.action_type = LWW_UPDATE_ACTION.to_string();
        update.payload = json!({"id": "t9", "title": "won"});
        state.apply_operation(&update).unwrap();
        assert_eq!(*state.entity("TASK", "t9").unwrap(), json!({"id": "t9", "title": "won"}));
    }

    #[test]
    fn full_state_op_replaces_everything() {
        let mut state = tasks();
        let replacement = AppState::new().with_entities("TAG", [("g1", json!({"id": "g1"}))].into_iter().collect());
        let mut import = op("B", OpType::SyncImport, "ALL", "*", [("B", 1)]);
        import.payload = replacement.to_value().unwrap();
        state.apply_operation(&import).unwrap();
        assert_eq!(state, replacement);
    }

    #[test]
    fn upsert_keeps_untouched_entities_pointer_equal() {
        let before = tasks().with_entities("TAG", [("g1", json!({"id": "g1"}))].into_iter().collect());
        let mut after = before.clone();
        after.upsert_entity("TASK", "t2", json!({"id": "t2"}));
        assert!(Arc::ptr_eq(before.slice("TAG").unwrap(), after.slice("TAG").unwrap()));
        let (Slice::Entities(b), Slice::Entities(a)) = (before.slice("TASK").unwrap().as_ref(), after.slice("TASK").unwrap().as_ref()) else {
            panic!("expected entity slices")
        };
        assert!(Arc::ptr_eq(b.get("t1").unwrap(), a.get("t1").unwrap()));
    }

    #[test]
    fn serialized_form_is_tagged_by_slice_kind() {
        let value = tasks().to_value().unwrap();
        assert_eq!(value["TASK"]["entities"]["t1"]["title"], "a");
        assert_eq!(value["GLOBAL_CONFIG"]["singleton"]["theme"], "dark");
        assert_eq!(AppState::from_value(value).unwrap(), tasks());
    }
}
