use std::collections::BTreeMap;

use crate::{
    bytecode::CodeObject,
    exception_private::TraceFrame,
    resource::{ResourceError, ResourceTracker},
    types::{
        AIterWrapper, AsyncGenAwaitable, BoundMethod, BuiltinMethod, ContextManager, Dict, ExceptionObject, Function,
        Generator, Iter, Module, Range, Set, Slice,
    },
    value::Value,
};

/// Counts of what is alive in the arena, as reported by `Heap::heap_stats`.
///
/// Ordered by variant name so two snapshots compare and print the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    /// Vacated slots waiting on the free list.
    pub free_slots: usize,
    /// Live objects keyed by kind (`"List"`, `"Generator"`, ...).
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Allocations seen by the resource tracker, when it counts them.
    pub tracker_allocations: Option<usize>,
}

/// Index of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Every kind of object that lives in the arena.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Dict),
    Set(Set),
    /// A closure cell; `Value::Undefined` marks an empty cell.
    Cell(Value),
    Code(CodeObject),
    Function(Function),
    BoundMethod(BoundMethod),
    BuiltinMethod(BuiltinMethod),
    Exception(ExceptionObject),
    Traceback(Vec<TraceFrame>),
    Generator(Generator),
    Iter(Iter),
    Range(Range),
    Slice(Slice),
    Module(Module),
    ContextManager(ContextManager),
    /// A value yielded by an async generator, unwrapped by its `asend` awaitable.
    AsyncGenWrapped(Value),
    AsyncGenAwaitable(AsyncGenAwaitable),
    AIterWrapper(AIterWrapper),
    /// Iterator returned by `coroutine.__await__()`; drives the wrapped coroutine.
    CoroutineWrapper(HeapId),
}

impl HeapData {
    /// Variant name used for heap statistics.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::List(_) => "List",
            Self::Tuple(_) => "Tuple",
            Self::Dict(_) => "Dict",
            Self::Set(_) => "Set",
            Self::Cell(_) => "Cell",
            Self::Code(_) => "Code",
            Self::Function(_) => "Function",
            Self::BoundMethod(_) => "BoundMethod",
            Self::BuiltinMethod(_) => "BuiltinMethod",
            Self::Exception(_) => "Exception",
            Self::Traceback(_) => "Traceback",
            Self::Generator(_) => "Generator",
            Self::Iter(_) => "Iter",
            Self::Range(_) => "Range",
            Self::Slice(_) => "Slice",
            Self::Module(_) => "Module",
            Self::ContextManager(_) => "ContextManager",
            Self::AsyncGenWrapped(_) => "AsyncGenWrapped",
            Self::AsyncGenAwaitable(_) => "AsyncGenAwaitable",
            Self::AIterWrapper(_) => "AIterWrapper",
            Self::CoroutineWrapper(_) => "CoroutineWrapper",
        }
    }

    /// Rough size estimate in bytes, used by memory-limited trackers.
    pub fn estimate_size(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        base + match self {
            Self::Str(s) => s.len(),
            Self::List(items) | Self::Tuple(items) => items.len() * std::mem::size_of::<Value>(),
            Self::Dict(d) => d.len() * 3 * std::mem::size_of::<Value>(),
            Self::Set(s) => s.len() * 2 * std::mem::size_of::<Value>(),
            Self::Traceback(frames) => frames.len() * std::mem::size_of::<TraceFrame>(),
            _ => 0,
        }
    }

    /// Releases every reference this object holds.
    fn release(self, heap: &mut Heap<impl ResourceTracker>) {
        match self {
            Self::Str(_) | Self::Traceback(_) | Self::Range(_) => {}
            Self::List(items) | Self::Tuple(items) => items.drop_with_heap(heap),
            Self::Dict(d) => d.drop_with_heap(heap),
            Self::Set(s) => s.drop_with_heap(heap),
            Self::Cell(v) | Self::AsyncGenWrapped(v) => v.drop_with_heap(heap),
            Self::Code(code) => code.drop_with_heap(heap),
            Self::Function(f) => f.drop_with_heap(heap),
            Self::BoundMethod(m) => m.drop_with_heap(heap),
            Self::BuiltinMethod(m) => m.drop_with_heap(heap),
            Self::Exception(e) => e.drop_with_heap(heap),
            Self::Generator(g) => g.drop_with_heap(heap),
            Self::Iter(i) => i.drop_with_heap(heap),
            Self::Slice(s) => s.drop_with_heap(heap),
            Self::Module(m) => m.drop_with_heap(heap),
            Self::ContextManager(cm) => cm.drop_with_heap(heap),
            Self::AsyncGenAwaitable(a) => a.drop_with_heap(heap),
            Self::AIterWrapper(w) => w.drop_with_heap(heap),
            Self::CoroutineWrapper(id) => heap.dec_ref(id),
        }
    }
}

/// A single entry inside the heap arena.
#[derive(Debug)]
struct HeapValue {
    refcount: usize,
    data: HeapData,
}

/// Reference-counted arena holding every object that is not an immediate `Value`.
///
/// Freed slots go on a free list and are handed out again before the arena
/// grows.
///
/// Generic over `T: ResourceTracker` so that with `NoLimitTracker` all resource
/// checks compile away to no-ops.
#[derive(Debug)]
pub struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapValue>>,
    free_list: Vec<HeapId>,
    tracker: T,
}

impl<T: ResourceTracker> Heap<T> {
    /// Creates a new heap with the given resource tracker.
    pub fn new(capacity: usize, tracker: T) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates a new heap entry with a refcount of one, returning its id.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        let new_entry = HeapValue {
            refcount: 1,
            data,
        };

        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(new_entry);
            id
        } else {
            let id = self.entries.len();
            self.entries.push(Some(new_entry));
            HeapId(id)
        };
        Ok(id)
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn inc_ref(&mut self, id: HeapId) {
        let value = self
            .entries
            .get_mut(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_mut()
            .expect("Heap::inc_ref: object already freed");
        value.refcount += 1;
    }

    /// Decrements the reference count and frees the value (plus children) once it hits zero.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let value = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            if entry.refcount > 1 {
                entry.refcount -= 1;
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };
        self.free_list.push(id);

        let data = value.data;
        self.tracker.on_free(|| data.estimate_size());
        data.release(self);
    }

    /// Returns an immutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// Returns a mutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Returns the reference count for the heap entry at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    #[must_use]
    pub fn get_refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .expect("Heap::get_refcount: slot missing")
            .as_ref()
            .expect("Heap::get_refcount: object already freed")
            .refcount
    }

    /// Takes a snapshot of the arena contents.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        let mut live_objects = 0;
        let mut free_slots = 0;
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        for slot in &self.entries {
            match slot {
                Some(entry) => {
                    live_objects += 1;
                    let name = entry.data.variant_name();
                    *objects_by_type.entry(name).or_insert(0) += 1;
                }
                None => free_slots += 1,
            }
        }
        HeapStats {
            live_objects,
            free_slots,
            objects_by_type,
            tracker_allocations: self.tracker.allocation_count(),
        }
    }

    /// Number of live (non-freed) values on the heap.
    #[must_use]
    #[cfg(feature = "ref-count-return")]
    pub fn entry_count(&self) -> usize {
        self.entries.iter().filter(|o| o.is_some()).count()
    }

    // ------------------------------------------------------------------------
    // Allocation helpers
    // ------------------------------------------------------------------------

    pub(crate) fn alloc_str(&mut self, s: impl Into<String>) -> Result<Value, ResourceError> {
        Ok(Value::Ref(self.allocate(HeapData::Str(s.into()))?))
    }

    pub(crate) fn alloc_tuple(&mut self, items: Vec<Value>) -> Result<Value, ResourceError> {
        Ok(Value::Ref(self.allocate(HeapData::Tuple(items))?))
    }

    pub(crate) fn alloc_list(&mut self, items: Vec<Value>) -> Result<Value, ResourceError> {
        Ok(Value::Ref(self.allocate(HeapData::List(items))?))
    }

    /// Takes one more reference to every heap value in `values`.
    ///
    /// Used after `copy_for_extend` copies, which do not touch refcounts.
    pub(crate) fn inc_ref_values(&mut self, values: &[Value]) {
        for value in values {
            if let Value::Ref(id) = value {
                self.inc_ref(*id);
            }
        }
    }

    /// Returns new references to the items of a list or tuple.
    pub(crate) fn sequence_items(&mut self, id: HeapId) -> Option<Vec<Value>> {
        let items: Vec<Value> = match self.get(id) {
            HeapData::List(items) | HeapData::Tuple(items) => items.iter().map(Value::copy_for_extend).collect(),
            _ => return None,
        };
        self.inc_ref_values(&items);
        Some(items)
    }

    pub(crate) fn alloc_cell(&mut self, value: Value) -> Result<HeapId, ResourceError> {
        self.allocate(HeapData::Cell(value))
    }

    /// Returns a new reference to the contents of a cell (`Undefined` when empty).
    pub(crate) fn cell_get(&mut self, id: HeapId) -> Value {
        let HeapData::Cell(v) = self.get(id) else {
            return Value::Undefined;
        };
        let copy = v.copy_for_extend();
        if let Value::Ref(inner) = copy {
            self.inc_ref(inner);
        }
        copy
    }

    /// Stores into a cell, releasing the previous contents.
    pub(crate) fn cell_set(&mut self, id: HeapId, value: Value) {
        let old = match self.get_mut(id) {
            HeapData::Cell(slot) => std::mem::replace(slot, value),
            _ => value,
        };
        old.drop_with_heap(self);
    }
}

/// Trait for types that require heap access for proper cleanup.
///
/// Rust's standard `Drop` trait cannot decrement heap reference counts because it has no
/// access to the `Heap`. Every type holding `Value`s must be released through this trait
/// on every code path, including early returns.
pub(crate) trait DropWithHeap<T: ResourceTracker> {
    /// Consume `self` and decrement reference counts for any heap-allocated values contained within.
    fn drop_with_heap(self, heap: &mut Heap<T>);
}

impl<T: ResourceTracker> DropWithHeap<T> for Value {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        Self::drop_with_heap(self, heap);
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for HeapId {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        heap.dec_ref(self);
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for Option<U> {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Some(value) = self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for Vec<U> {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, A: smallvec::Array> DropWithHeap<T> for smallvec::SmallVec<A>
where
    A::Item: DropWithHeap<T>,
{
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>, const N: usize> DropWithHeap<T> for [U; N] {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, A: DropWithHeap<T>, B: DropWithHeap<T>> DropWithHeap<T> for (A, B) {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.0.drop_with_heap(heap);
        self.1.drop_with_heap(heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn free_list_reuses_slots() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let a = heap.allocate(HeapData::Str("a".into())).unwrap();
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::Str("b".into())).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.get_refcount(b), 1);
    }

    #[test]
    fn children_released_with_parent() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let s = heap.alloc_str("x").unwrap();
        let list = heap.alloc_list(vec![s]).unwrap();
        assert_eq!(heap.heap_stats().live_objects, 2);
        list.drop_with_heap(&mut heap);
        let stats = heap.heap_stats();
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.free_slots, 2);
    }

    #[test]
    fn refcount_tracks_shared_references() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let id = heap.allocate(HeapData::List(Vec::new())).unwrap();
        heap.inc_ref(id);
        assert_eq!(heap.get_refcount(id), 2);
        heap.dec_ref(id);
        assert_eq!(heap.get_refcount(id), 1);
    }
}
