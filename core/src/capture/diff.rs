use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use oplog_proto::{OpType, SINGLETON_ID};
use serde_json::{json, Map, Value};

use super::EntityChange;
use crate::state::{AppState, EntitySlice, Slice};

#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// Values nested deeper than this are treated as changed rather than compared
    pub max_depth: usize,
}

impl Default for DiffOptions {
    fn default() -> Self { Self { max_depth: 32 } }
}

/// Entity-level changes turning `before` into `after`.
///
/// Slices and entities that are pointer-equal are skipped without inspection. Everything else
/// is compared structurally with [`deep_equal`].
pub fn diff_states(before: &AppState, after: &AppState, options: &DiffOptions) -> Vec<EntityChange> {
    let names: BTreeSet<&String> = before.slice_names().into_iter().chain(after.slice_names()).collect();
    let mut changes = Vec::new();

    for name in names {
        match (before.slice(name), after.slice(name)) {
            (Some(b), Some(a)) if Arc::ptr_eq(b, a) => {}
            (Some(b), Some(a)) => diff_slice(name, Some(b), Some(a), options, &mut changes),
            (b, a) => diff_slice(name, b, a, options, &mut changes),
        }
    }
    changes
}

fn diff_slice(name: &str, before: Option<&Arc<Slice>>, after: Option<&Arc<Slice>>, options: &DiffOptions, out: &mut Vec<EntityChange>) {
    let empty = EntitySlice::default();
    match (before.map(|s| s.as_ref()), after.map(|s| s.as_ref())) {
        (Some(Slice::Entities(b)), Some(Slice::Entities(a))) => diff_entities(name, b, a, options, out),
        (Some(Slice::Singleton(b)), Some(Slice::Singleton(a))) => diff_singleton(name, b, a, options, out),
        (None, Some(Slice::Entities(a))) => diff_entities(name, &empty, a, options, out),
        (Some(Slice::Entities(b)), None) => diff_entities(name, b, &empty, options, out),
        (None, Some(Slice::Singleton(a))) => diff_singleton(name, &Arc::new(Value::Null), a, options, out),
        (Some(Slice::Singleton(b)), None) => diff_singleton(name, b, &Arc::new(Value::Null), options, out),
        // the slice changed kind; describe it as removal followed by creation
        (Some(b), Some(a)) => {
            diff_slice(name, Some(&Arc::new(b.clone())), None, options, out);
            diff_slice(name, None, Some(&Arc::new(a.clone())), options, out);
        }
        (None, None) => {}
    }
}

fn diff_entities(entity_type: &str, before: &EntitySlice, after: &EntitySlice, options: &DiffOptions, out: &mut Vec<EntityChange>) {
    for (id, _) in before.iter() {
        if after.get(id).is_none() {
            out.push(EntityChange::new(entity_type, id, OpType::Delete, json!({ "id": id })));
        }
    }
    for (id, new) in after.iter() {
        match before.get(id) {
            None => out.push(EntityChange::new(entity_type, id, OpType::Create, new.as_ref().clone())),
            Some(old) if Arc::ptr_eq(old, new) => {}
            Some(old) => {
                if let Some(update) = sparse_update(old, new, options) {
                    out.push(EntityChange::new(entity_type, id, OpType::Update, update));
                }
            }
        }
    }
}

fn diff_singleton(name: &str, before: &Arc<Value>, after: &Arc<Value>, options: &DiffOptions, out: &mut Vec<EntityChange>) {
    if Arc::ptr_eq(before, after) {
        return;
    }
    match (before.is_null(), after.is_null()) {
        (true, true) => {}
        (false, true) => out.push(EntityChange::new(name, SINGLETON_ID, OpType::Delete, json!({ "id": SINGLETON_ID }))),
        (true, false) => out.push(EntityChange::new(name, SINGLETON_ID, OpType::Create, after.as_ref().clone())),
        (false, false) => {
            if let Some(update) = sparse_update(before, after, options) {
                out.push(EntityChange::new(name, SINGLETON_ID, OpType::Update, update));
            }
        }
    }
}

/// Changed top-level fields of `new`, removed fields as `null`. `None` if nothing changed.
/// Non-object values are replaced wholesale.
fn sparse_update(old: &Value, new: &Value, options: &DiffOptions) -> Option<Value> {
    let (Value::Object(old_map), Value::Object(new_map)) = (old, new) else {
        return (!deep_equal(old, new, 0, options.max_depth, &mut HashSet::new())).then(|| new.clone());
    };

    let mut visited = HashSet::new();
    let mut changed = Map::new();
    for (field, value) in new_map {
        match old_map.get(field) {
            Some(prev) if deep_equal(prev, value, 1, options.max_depth, &mut visited) => {}
            _ => {
                changed.insert(field.clone(), value.clone());
            }
        }
    }
    for field in old_map.keys() {
        if !new_map.contains_key(field) {
            changed.insert(field.clone(), Value::Null);
        }
    }
    (!changed.is_empty()).then_some(Value::Object(changed))
}

/// Structural equality bounded by `max_depth`.
///
/// `visited` holds address pairs already proven equal so shared subtrees are compared once.
/// Exceeding the depth bound reports inequality, which at worst produces a redundant update.
pub fn deep_equal(a: &Value, b: &Value, depth: usize, max_depth: usize, visited: &mut HashSet<(usize, usize)>) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    if depth > max_depth {
        return false;
    }
    let pair = (a as *const Value as usize, b as *const Value as usize);
    if visited.contains(&pair) {
        return true;
    }

    let equal = match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| deep_equal(v, w, depth + 1, max_depth, visited)))
        }
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(v, w)| deep_equal(v, w, depth + 1, max_depth, visited)),
        _ => a == b,
    };
    if equal {
        visited.insert(pair);
    }
    equal
}
