use ahash::RandomState;
use indexmap::IndexMap;

use crate::{
    builtins::Builtins,
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Hashable projection of a Python value, used as the key of dicts and sets.
///
/// Keys that compare equal in Python map to the same `HashKey`: `True`, `1` and
/// `1.0` all become `Int(1)`. Objects without value equality (functions, modules,
/// generators...) hash by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum HashKey {
    None,
    Int(i64),
    /// Non-integral float, stored by bit pattern.
    Float(u64),
    Str(String),
    Tuple(Vec<HashKey>),
    Builtin(Builtins),
    ExcClass(ExcType),
    Id(HeapId),
}

impl HashKey {
    pub fn from_value(value: &Value, heap: &Heap<impl ResourceTracker>) -> RunResult<Self> {
        Ok(match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Int(i64::from(*b)),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::Builtin(b) => Self::Builtin(*b),
            Value::ExcClass(e) => Self::ExcClass(*e),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Self::Str(s.clone()),
                HeapData::Tuple(items) => Self::Tuple(
                    items
                        .iter()
                        .map(|item| Self::from_value(item, heap))
                        .collect::<RunResult<_>>()?,
                ),
                HeapData::List(_) | HeapData::Dict(_) | HeapData::Set(_) | HeapData::Slice(_) => {
                    return Err(ExcType::type_error_unhashable(value.type_name(heap)));
                }
                _ => Self::Id(*id),
            },
            _ => return Err(RunError::internal("hash of an unbound value")),
        })
    }

    /// Key for a plain string; avoids allocating a heap string for lookups.
    pub fn str(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

#[expect(clippy::cast_possible_truncation, reason = "range checked before the cast")]
fn float_key(f: f64) -> HashKey {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        HashKey::Int(f as i64)
    } else {
        HashKey::Float(f.to_bits())
    }
}

/// Insertion-ordered Python dict.
///
/// Each entry keeps the original key object next to the value so iteration can
/// hand back real keys, not their hash projection.
#[derive(Debug, Default)]
pub(crate) struct Dict {
    map: IndexMap<HashKey, (Value, Value), RandomState>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: IndexMap::with_capacity_and_hasher(capacity, RandomState::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn get(&self, key: &HashKey) -> Option<&Value> {
        self.map.get(key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.get(&HashKey::str(key))
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or overwrites an entry.
    ///
    /// On overwrite the original key object is kept; the returned pair holds the
    /// values the caller must release (the unused new key and the old value).
    #[must_use]
    pub fn insert(&mut self, hash: HashKey, key: Value, value: Value) -> Option<(Value, Value)> {
        match self.map.get_mut(&hash) {
            Some((_, slot)) => Some((key, std::mem::replace(slot, value))),
            None => {
                self.map.insert(hash, (key, value));
                None
            }
        }
    }

    /// Removes an entry, keeping the order of the remaining ones.
    #[must_use]
    pub fn remove(&mut self, key: &HashKey) -> Option<(Value, Value)> {
        self.map.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.map.values().map(|(k, v)| (k, v))
    }

    pub fn get_index(&self, index: usize) -> Option<(&Value, &Value)> {
        self.map.get_index(index).map(|(_, (k, v))| (k, v))
    }

    /// Returns string keys in insertion order, skipping non-string keys.
    pub fn str_keys(&self) -> Vec<String> {
        self.map
            .keys()
            .filter_map(|k| match k {
                HashKey::Str(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn py_eq(&self, other: &Self, heap: &Heap<impl ResourceTracker>) -> bool {
        self.len() == other.len()
            && self
                .map
                .iter()
                .all(|(hash, (_, v))| other.get(hash).is_some_and(|ov| v.py_eq(ov, heap)))
    }

    /// Drains all entries in order.
    pub fn drain(&mut self) -> impl Iterator<Item = (HashKey, (Value, Value))> + '_ {
        self.map.drain(..)
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Dict {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for (_, pair) in self.map {
            pair.drop_with_heap(heap);
        }
    }
}

/// Stores `value` under `key` in the dict at `dict_id`, releasing displaced values.
pub(crate) fn dict_set_item(
    heap: &mut Heap<impl ResourceTracker>,
    dict_id: HeapId,
    key: Value,
    value: Value,
) -> RunResult<()> {
    let hash = match key.hash_key(heap) {
        Ok(hash) => hash,
        Err(e) => {
            key.drop_with_heap(heap);
            value.drop_with_heap(heap);
            return Err(e);
        }
    };
    let displaced = match heap.get_mut(dict_id) {
        HeapData::Dict(d) => d.insert(hash, key, value),
        _ => Some((key, value)),
    };
    displaced.drop_with_heap(heap);
    Ok(())
}

/// Looks up `key` in the dict at `dict_id`, returning a new reference.
pub(crate) fn dict_get_item(heap: &mut Heap<impl ResourceTracker>, dict_id: HeapId, key: &HashKey) -> Option<Value> {
    let HeapData::Dict(d) = heap.get(dict_id) else {
        return None;
    };
    let found = d.get(key)?.copy_for_extend();
    if let Value::Ref(id) = &found {
        heap.inc_ref(*id);
    }
    Some(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn numeric_keys_collapse() {
        let heap = Heap::new(0, NoLimitTracker);
        let one = HashKey::from_value(&Value::Int(1), &heap).unwrap();
        assert_eq!(HashKey::from_value(&Value::Bool(true), &heap).unwrap(), one);
        assert_eq!(HashKey::from_value(&Value::Float(1.0), &heap).unwrap(), one);
        assert_ne!(HashKey::from_value(&Value::Float(1.5), &heap).unwrap(), one);
    }

    #[test]
    fn overwrite_keeps_first_key_and_order() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let dict_id = heap.allocate(HeapData::Dict(Dict::new())).unwrap();
        dict_set_item(&mut heap, dict_id, Value::Int(1), Value::Int(10)).unwrap();
        dict_set_item(&mut heap, dict_id, Value::Int(2), Value::Int(20)).unwrap();
        dict_set_item(&mut heap, dict_id, Value::Bool(true), Value::Int(30)).unwrap();
        let HeapData::Dict(d) = heap.get(dict_id) else { panic!("not a dict") };
        let entries: Vec<_> = d
            .iter()
            .map(|(k, v)| (k.as_index().unwrap(), v.as_index().unwrap()))
            .collect();
        assert_eq!(entries, vec![(1, 30), (2, 20)]);
        assert!(matches!(d.get_index(0), Some((Value::Int(1), _))));
    }

    #[test]
    fn unhashable_key_is_released() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let dict_id = heap.allocate(HeapData::Dict(Dict::new())).unwrap();
        let list = heap.alloc_list(Vec::new()).unwrap();
        assert!(dict_set_item(&mut heap, dict_id, list, Value::None).is_err());
        assert_eq!(heap.heap_stats().live_objects, 1);
    }
}
