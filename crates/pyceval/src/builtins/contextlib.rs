//! The callables exposed by the native `contextlib` and `sys` modules.

use super::{at_most, one_arg, unpack_args};
use crate::{
    bytecode::vm::VM,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{BuiltinMethod, ContextManager, MethodKind},
    value::Value,
};

/// `contextlib.suppress(*exceptions)`.
pub(super) fn builtin_suppress(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let classes: Option<Vec<ExcType>> = args
        .iter()
        .map(|arg| match arg {
            Value::ExcClass(exc_type) => Some(*exc_type),
            _ => None,
        })
        .collect();
    args.drop_with_heap(heap);
    let classes = classes.ok_or_else(|| {
        ExcType::type_error("catching classes that do not inherit from BaseException is not allowed")
    })?;
    Ok(Value::Ref(heap.allocate(HeapData::ContextManager(ContextManager::Suppress(classes)))?))
}

/// `contextlib.nullcontext(enter_result=None)`.
pub(super) fn builtin_nullcontext(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let args = at_most(heap, "nullcontext", args, 1)?;
    let enter_result = args.into_iter().next().unwrap_or(Value::None);
    Ok(Value::Ref(
        heap.allocate(HeapData::ContextManager(ContextManager::NullContext(enter_result)))?,
    ))
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `contextlib.contextmanager(func)`: a factory whose calls wrap `func(...)`.
    pub(super) fn builtin_contextmanager(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let func = one_arg(self.heap, "contextmanager", args)?;
        if !self.is_callable(&func) {
            let msg = format!("'{}' object is not callable", func.type_name(self.heap));
            func.drop_with_heap(self.heap);
            return Err(ExcType::type_error(msg));
        }
        self.alloc(HeapData::BuiltinMethod(BuiltinMethod {
            receiver: func,
            method: MethodKind::GeneratorCmFactory,
        }))
    }

    /// `sys.exc_info()`: the exception being handled, as a 3-tuple.
    pub(super) fn builtin_exc_info(&mut self, args: Vec<Value>) -> RunResult<Value> {
        unpack_args(self.heap, "exc_info", args, 0, 0)?;
        let triple = self.exc_info.to_python(self.heap);
        Ok(self.heap.alloc_tuple(triple.into())?)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, Const, Object, Opcode, Runner};

    #[test]
    fn nullcontext_returns_enter_result() {
        let mut b = CodeBuilder::module("<test>");
        b.load_const(0);
        b.load_const(Const::Tuple(vec!["nullcontext".into()]));
        b.import_name("contextlib");
        b.import_from("nullcontext");
        b.store_name("nullcontext");
        b.pop_top();
        let done = b.new_label();
        b.load_name("nullcontext");
        b.load_const(5);
        b.call_function(1);
        b.emit_jump(Opcode::SetupWith, done);
        b.store_name("x");
        b.emit(Opcode::PopBlock);
        b.load_none();
        b.bind(done);
        b.emit(Opcode::WithCleanupStart);
        b.emit(Opcode::WithCleanupFinish);
        b.emit(Opcode::EndFinally);
        b.load_name("x");
        b.return_value();
        assert_eq!(Runner::new(b.build()).run_no_limits().unwrap(), Object::Int(5));
    }

    #[test]
    fn exc_info_outside_handler_is_all_none() {
        let mut b = CodeBuilder::module("<test>");
        b.load_const(0);
        b.load_none();
        b.import_name("sys");
        b.load_attr("exc_info");
        b.call_function(0);
        b.return_value();
        let result = Runner::new(b.build()).run_no_limits().unwrap();
        assert_eq!(result.to_string(), "(None, None, None)");
    }
}
