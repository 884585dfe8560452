use std::fmt::Write;

use crate::{
    exception_private::{ExcType, RunResult, SimpleException},
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
    value::Value,
};

/// A materialized exception instance.
///
/// `cause`, `context` and `traceback` use `Value::None` for "not set", the same
/// way the Python attributes read.
#[derive(Debug)]
pub(crate) struct ExceptionObject {
    pub exc_type: ExcType,
    pub args: Vec<Value>,
    pub cause: Value,
    pub context: Value,
    pub traceback: Value,
    pub suppress_context: bool,
}

impl ExceptionObject {
    pub fn new(exc_type: ExcType, args: Vec<Value>) -> Self {
        Self {
            exc_type,
            args,
            cause: Value::None,
            context: Value::None,
            traceback: Value::None,
            suppress_context: false,
        }
    }

    pub fn from_simple(simple: SimpleException, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Self> {
        let exc_type = simple.exc_type();
        let args = match simple.into_arg() {
            Some(msg) => vec![heap.alloc_str(msg)?],
            None => Vec::new(),
        };
        Ok(Self::new(exc_type, args))
    }

    pub fn first_arg(&self) -> Option<&Value> {
        self.args.first()
    }

    /// `str(exc)`: empty for no args, the lone argument's `str()`, else the args tuple.
    ///
    /// `KeyError` with one argument uses `repr()` so the missing key stays readable.
    pub fn str_value(&self, heap: &Heap<impl ResourceTracker>) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [arg] if self.exc_type == ExcType::KeyError => arg.py_repr(heap),
            [arg] => arg.py_str(heap),
            args => {
                let mut out = String::from("(");
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&arg.py_repr(heap));
                }
                out.push(')');
                out
            }
        }
    }

    /// `repr(exc)` in the `ValueError('x',)` form.
    pub fn repr_into(&self, out: &mut String, heap: &Heap<impl ResourceTracker>) {
        let _ = write!(out, "{}(", self.exc_type);
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&arg.py_repr(heap));
        }
        if self.args.len() == 1 {
            out.push(',');
        }
        out.push(')');
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ExceptionObject {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.args.drop_with_heap(heap);
        self.cause.drop_with_heap(heap);
        self.context.drop_with_heap(heap);
        self.traceback.drop_with_heap(heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{heap::HeapData, resource::NoLimitTracker};

    #[test]
    fn str_and_repr() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let obj = ExceptionObject::from_simple(SimpleException::new_msg(ExcType::ValueError, "bad"), &mut heap).unwrap();
        assert_eq!(obj.str_value(&heap), "bad");
        let mut out = String::new();
        obj.repr_into(&mut out, &heap);
        assert_eq!(out, "ValueError('bad',)");
        let id = heap.allocate(HeapData::Exception(obj)).unwrap();
        heap.dec_ref(id);
        assert_eq!(heap.heap_stats().live_objects, 0);
    }

    #[test]
    fn key_error_uses_repr() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let key = heap.alloc_str("k").unwrap();
        let obj = ExceptionObject::new(ExcType::KeyError, vec![key]);
        assert_eq!(obj.str_value(&heap), "'k'");
        obj.drop_with_heap(&mut heap);
    }
}
