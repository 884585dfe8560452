use strum::{Display, IntoStaticStr};

use crate::{
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// A function created by `MAKE_FUNCTION`.
///
/// The code object and globals are held by reference; `defaults` is a tuple,
/// `kwdefaults` a dict and `closure` a tuple of cells, all optional.
#[derive(Debug)]
pub(crate) struct Function {
    pub code: HeapId,
    pub globals: HeapId,
    pub name: String,
    pub qualname: String,
    pub defaults: Option<HeapId>,
    pub kwdefaults: Option<HeapId>,
    pub closure: Option<HeapId>,
    pub annotations: Option<HeapId>,
    /// Lazily created `__dict__` for arbitrary function attributes.
    pub dict: Option<HeapId>,
}

impl<T: ResourceTracker> DropWithHeap<T> for Function {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        heap.dec_ref(self.code);
        heap.dec_ref(self.globals);
        self.defaults.drop_with_heap(heap);
        self.kwdefaults.drop_with_heap(heap);
        self.closure.drop_with_heap(heap);
        self.annotations.drop_with_heap(heap);
        self.dict.drop_with_heap(heap);
    }
}

/// A function bound to a receiver; calling it prepends the receiver to the arguments.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub func: Value,
    pub receiver: Value,
}

impl<T: ResourceTracker> DropWithHeap<T> for BoundMethod {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.func.drop_with_heap(heap);
        self.receiver.drop_with_heap(heap);
    }
}

/// Native methods reachable through attribute access on built-in objects.
///
/// The display name is the Python attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub(crate) enum MethodKind {
    #[strum(serialize = "append")]
    ListAppend,
    #[strum(serialize = "pop")]
    ListPop,
    #[strum(serialize = "extend")]
    ListExtend,
    #[strum(serialize = "keys")]
    DictKeys,
    #[strum(serialize = "items")]
    DictItems,
    #[strum(serialize = "values")]
    DictValues,
    #[strum(serialize = "get")]
    DictGet,
    #[strum(serialize = "join")]
    StrJoin,
    #[strum(serialize = "send")]
    GenSend,
    #[strum(serialize = "throw")]
    GenThrow,
    #[strum(serialize = "close")]
    GenClose,
    #[strum(serialize = "__next__")]
    GenNext,
    #[strum(serialize = "__await__")]
    CoroAwait,
    #[strum(serialize = "asend")]
    AsyncGenAsend,
    #[strum(serialize = "athrow")]
    AsyncGenAthrow,
    #[strum(serialize = "aclose")]
    AsyncGenAclose,
    #[strum(serialize = "__anext__")]
    AsyncGenAnext,
    #[strum(serialize = "__aiter__")]
    AsyncGenAiter,
    #[strum(serialize = "__get__")]
    FuncGet,
    #[strum(serialize = "__enter__")]
    CmEnter,
    #[strum(serialize = "__exit__")]
    CmExit,
    #[strum(serialize = "__aenter__")]
    CmAenter,
    #[strum(serialize = "__aexit__")]
    CmAexit,
    /// `contextlib.contextmanager(func)`: calling it wraps `func(...)` in a context manager.
    #[strum(serialize = "contextmanager")]
    GeneratorCmFactory,
}

/// A native method together with the object it was looked up on.
#[derive(Debug)]
pub(crate) struct BuiltinMethod {
    pub receiver: Value,
    pub method: MethodKind,
}

impl<T: ResourceTracker> DropWithHeap<T> for BuiltinMethod {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.receiver.drop_with_heap(heap);
    }
}
