//! Heap object types.
//!
//! Every struct here is stored inside a [`HeapData`](crate::heap::HeapData) variant and
//! implements `DropWithHeap` so the arena can release the values it owns.

mod asyncgen;
mod contextlib;
mod dict;
mod exception;
mod function;
mod generator;
mod iter;
mod module;
mod range;
mod set;

pub(crate) use asyncgen::{AIterWrapper, AsyncGenAwaitable, AwaitableMode, AwaitableState};
pub(crate) use contextlib::ContextManager;
pub(crate) use dict::{Dict, HashKey, dict_get_item, dict_set_item};
pub(crate) use exception::ExceptionObject;
pub(crate) use function::{BoundMethod, BuiltinMethod, Function, MethodKind};
pub(crate) use generator::{GenKind, Generator};
pub(crate) use iter::{Iter, IterSource, iter_next};
pub(crate) use module::Module;
pub(crate) use range::{Range, Slice, SliceIndices};
pub(crate) use set::Set;
