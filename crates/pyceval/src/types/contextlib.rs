use crate::{
    exception_private::ExcType,
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// The native context managers exposed by the `contextlib` module.
#[derive(Debug)]
pub(crate) enum ContextManager {
    /// `suppress(*excs)`: `__exit__` swallows any matching exception.
    Suppress(Vec<ExcType>),
    /// `nullcontext(enter_result=None)`; also usable with `async with`.
    NullContext(Value),
    /// Result of calling a `@contextmanager` function: drives the wrapped generator.
    Generator(HeapId),
}

impl ContextManager {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Suppress(_) => "suppress",
            Self::NullContext(_) => "nullcontext",
            Self::Generator(_) => "_GeneratorContextManager",
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ContextManager {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        match self {
            Self::Suppress(_) => {}
            Self::NullContext(v) => v.drop_with_heap(heap),
            Self::Generator(id) => heap.dec_ref(id),
        }
    }
}
