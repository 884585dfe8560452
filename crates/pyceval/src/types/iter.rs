use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    resource::ResourceTracker,
    value::Value,
};

use super::Range;

/// What an iterator walks over.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IterSource {
    List(HeapId),
    Tuple(HeapId),
    /// Position is a byte offset into the string.
    Str(HeapId),
    /// Iterates dict keys.
    Dict(HeapId),
    Set(HeapId),
    Range(Range),
}

impl IterSource {
    fn heap_id(self) -> Option<HeapId> {
        match self {
            Self::List(id) | Self::Tuple(id) | Self::Str(id) | Self::Dict(id) | Self::Set(id) => Some(id),
            Self::Range(_) => None,
        }
    }
}

/// Index-based iterator over a built-in container.
///
/// The iterator owns a reference to its source until it is exhausted, then drops
/// it so later `next()` calls keep reporting exhaustion without pinning the container.
#[derive(Debug)]
pub(crate) struct Iter {
    source: Option<IterSource>,
    index: usize,
    /// Size of a dict or set when iteration started.
    expected_len: usize,
    type_name: &'static str,
}

impl Iter {
    /// Creates an iterator; the caller transfers one reference to the source.
    pub fn new(source: IterSource, heap: &Heap<impl ResourceTracker>) -> Self {
        let (expected_len, type_name) = match source {
            IterSource::List(_) => (0, "list_iterator"),
            IterSource::Tuple(_) => (0, "tuple_iterator"),
            IterSource::Str(_) => (0, "str_iterator"),
            IterSource::Dict(id) => (
                match heap.get(id) {
                    HeapData::Dict(d) => d.len(),
                    _ => 0,
                },
                "dict_keyiterator",
            ),
            IterSource::Set(id) => (
                match heap.get(id) {
                    HeapData::Set(s) => s.len(),
                    _ => 0,
                },
                "set_iterator",
            ),
            IterSource::Range(_) => (0, "range_iterator"),
        };
        Self {
            source: Some(source),
            index: 0,
            expected_len,
            type_name,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Iter {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Some(id) = self.source.and_then(IterSource::heap_id) {
            heap.dec_ref(id);
        }
    }
}

/// Outcome of peeking at the source for the current position.
enum Step {
    Item(Value),
    NewStr(String, usize),
    Changed(&'static str),
    Done,
}

/// Advances the iterator at `iter_id`. `Ok(None)` means exhausted.
pub(crate) fn iter_next(heap: &mut Heap<impl ResourceTracker>, iter_id: HeapId) -> RunResult<Option<Value>> {
    let (source, index, expected_len) = match heap.get(iter_id) {
        HeapData::Iter(it) => match it.source {
            Some(source) => (source, it.index, it.expected_len),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };

    let step = match (source, heap.get(source.heap_id().unwrap_or(iter_id))) {
        (IterSource::Range(r), _) => r.get(index).map_or(Step::Done, |v| Step::Item(Value::Int(v))),
        (IterSource::List(_) | IterSource::Tuple(_), HeapData::List(items) | HeapData::Tuple(items)) => {
            items.get(index).map_or(Step::Done, |v| Step::Item(v.copy_for_extend()))
        }
        (IterSource::Str(_), HeapData::Str(s)) => match s[index..].chars().next() {
            Some(c) => Step::NewStr(c.to_string(), index + c.len_utf8()),
            None => Step::Done,
        },
        (IterSource::Dict(_), HeapData::Dict(d)) => {
            if d.len() == expected_len {
                d.get_index(index).map_or(Step::Done, |(k, _)| Step::Item(k.copy_for_extend()))
            } else {
                Step::Changed("dictionary changed size during iteration")
            }
        }
        (IterSource::Set(_), HeapData::Set(s)) => {
            if s.len() == expected_len {
                s.get_index(index).map_or(Step::Done, |v| Step::Item(v.copy_for_extend()))
            } else {
                Step::Changed("Set changed size during iteration")
            }
        }
        _ => Step::Done,
    };

    match step {
        Step::Item(value) => {
            if let Value::Ref(id) = &value {
                heap.inc_ref(*id);
            }
            set_index(heap, iter_id, index + 1);
            Ok(Some(value))
        }
        Step::NewStr(s, next) => {
            let value = heap.alloc_str(s)?;
            set_index(heap, iter_id, next);
            Ok(Some(value))
        }
        Step::Changed(msg) => {
            exhaust(heap, iter_id);
            Err(ExcType::runtime_error(msg))
        }
        Step::Done => {
            exhaust(heap, iter_id);
            Ok(None)
        }
    }
}

fn set_index(heap: &mut Heap<impl ResourceTracker>, iter_id: HeapId, index: usize) {
    if let HeapData::Iter(it) = heap.get_mut(iter_id) {
        it.index = index;
    }
}

fn exhaust(heap: &mut Heap<impl ResourceTracker>, iter_id: HeapId) {
    let source = match heap.get_mut(iter_id) {
        HeapData::Iter(it) => it.source.take(),
        _ => None,
    };
    if let Some(id) = source.and_then(IterSource::heap_id) {
        heap.dec_ref(id);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resource::NoLimitTracker;

    fn drain(heap: &mut Heap<NoLimitTracker>, iter_id: HeapId) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(v) = iter_next(heap, iter_id).unwrap() {
            out.push(v.py_repr(heap));
            v.drop_with_heap(heap);
        }
        out
    }

    #[test]
    fn str_iteration_is_by_char() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let s = heap.alloc_str("aé").unwrap();
        let source = IterSource::Str(s.ref_id().unwrap());
        s.forget();
        let it = Iter::new(source, &heap);
        let id = heap.allocate(HeapData::Iter(it)).unwrap();
        assert_eq!(drain(&mut heap, id), vec!["'a'", "'é'"]);
        // exhaustion released the string
        assert_eq!(heap.heap_stats().live_objects, 1);
        heap.dec_ref(id);
    }

    #[test]
    fn range_iteration() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let it = Iter::new(IterSource::Range(Range::new(3, 0, -1).unwrap()), &heap);
        let id = heap.allocate(HeapData::Iter(it)).unwrap();
        assert_eq!(drain(&mut heap, id), vec!["3", "2", "1"]);
        assert!(iter_next(&mut heap, id).unwrap().is_none());
    }
}
