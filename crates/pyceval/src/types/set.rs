use std::cmp::Ordering;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::{
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
    value::Value,
};

use super::HashKey;

/// Python set. Iteration follows insertion order.
#[derive(Debug, Default)]
pub(crate) struct Set {
    map: IndexMap<HashKey, Value, RandomState>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.map.contains_key(key)
    }

    /// Adds a member. Returns the value back when an equal member already exists.
    #[must_use]
    pub fn insert(&mut self, hash: HashKey, value: Value) -> Option<Value> {
        if self.map.contains_key(&hash) {
            Some(value)
        } else {
            self.map.insert(hash, value);
            None
        }
    }

    #[must_use]
    pub fn remove(&mut self, key: &HashKey) -> Option<Value> {
        self.map.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.map.values()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&HashKey, &Value)> {
        self.map.iter()
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.map.get_index(index).map(|(_, v)| v)
    }

    pub fn py_eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.map.keys().all(|k| other.contains(k))
    }

    /// Subset ordering used by `<`, `<=`, `>` and `>=`.
    pub fn subset_cmp(&self, other: &Self) -> Option<Ordering> {
        let self_in_other = self.map.keys().all(|k| other.contains(k));
        let other_in_self = other.map.keys().all(|k| self.contains(k));
        match (self_in_other, other_in_self) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    pub fn values_copy(&self) -> Vec<Value> {
        self.map.values().map(Value::copy_for_extend).collect()
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Set {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for (_, value) in self.map {
            value.drop_with_heap(heap);
        }
    }
}
