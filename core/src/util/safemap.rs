use std::{collections::hash_map::Entry, collections::HashMap, hash::Hash};

/// A very basic concurrent hashmap that is hard to misuse in an async context.
/// A lock is only ever held briefly, with no calls into other functions that might block.
#[derive(Default)]
pub struct SafeMap<K: Hash + Eq, V>(std::sync::RwLock<HashMap<K, V>>);

impl<K: Hash + Eq, V> SafeMap<K, V> {
    pub fn new() -> Self { Self(std::sync::RwLock::new(HashMap::new())) }

    pub fn insert(&self, key: K, value: V) { self.0.write().expect("Failed to lock the map").insert(key, value); }

    pub fn remove(&self, key: &K) -> Option<V> { self.0.write().expect("Failed to lock the map").remove(key) }

    pub fn len(&self) -> usize { self.0.read().expect("Failed to lock the map").len() }

    pub fn is_empty(&self) -> bool { self.0.read().expect("Failed to lock the map").is_empty() }

    pub fn contains_key(&self, key: &K) -> bool { self.0.read().expect("Failed to lock the map").contains_key(key) }
}

impl<K: Hash + Eq, V> SafeMap<K, V>
where V: Clone
{
    pub fn get(&self, k: &K) -> Option<V> { self.0.read().expect("Failed to lock the map").get(k).cloned() }

    /// Get the value for `k`, inserting the result of `f` first if absent
    pub fn get_or_insert_with(&self, k: K, f: impl FnOnce() -> V) -> V {
        match self.0.write().expect("Failed to lock the map").entry(k) {
            Entry::Occupied(o) => o.get().clone(),
            Entry::Vacant(v) => v.insert(f()).clone(),
        }
    }
}
