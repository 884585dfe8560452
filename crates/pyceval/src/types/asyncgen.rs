use crate::{
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Which async-generator method produced an awaitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwaitableMode {
    /// `asend(value)` / `__anext__()`.
    Send,
    /// `athrow(typ, val, tb)`.
    Throw,
    /// `aclose()`.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwaitableState {
    Init,
    Iter,
    Closed,
}

/// Awaitable returned by `asend`, `athrow` and `aclose` of an async generator.
///
/// Each `send` into it drives the generator one step; a plain yield inside the
/// generator becomes `StopIteration(value)` for the awaiting coroutine, while
/// awaits inside the generator pass through untouched.
#[derive(Debug)]
pub(crate) struct AsyncGenAwaitable {
    pub gen_id: HeapId,
    pub mode: AwaitableMode,
    pub state: AwaitableState,
    /// `asend` argument, consumed by the first send.
    pub send_value: Value,
    /// `athrow` arguments (type, value, traceback); `Undefined` when absent.
    pub throw_args: [Value; 3],
}

impl AsyncGenAwaitable {
    pub fn new(gen_id: HeapId, mode: AwaitableMode, send_value: Value, throw_args: [Value; 3]) -> Self {
        Self {
            gen_id,
            mode,
            state: AwaitableState::Init,
            send_value,
            throw_args,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.mode {
            AwaitableMode::Send => "async_generator_asend",
            AwaitableMode::Throw | AwaitableMode::Close => "async_generator_athrow",
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for AsyncGenAwaitable {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        heap.dec_ref(self.gen_id);
        self.send_value.drop_with_heap(heap);
        for value in self.throw_args {
            value.drop_with_heap(heap);
        }
    }
}

/// An awaitable that completes immediately with `value`.
///
/// Produced by `GET_AITER` on objects whose `__aiter__` result is used directly,
/// and by the `__aenter__`/`__aexit__` of native async context managers.
#[derive(Debug)]
pub(crate) struct AIterWrapper {
    pub value: Value,
}

impl<T: ResourceTracker> DropWithHeap<T> for AIterWrapper {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.value.drop_with_heap(heap);
    }
}
