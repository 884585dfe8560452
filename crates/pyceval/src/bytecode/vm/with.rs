//! `with` and `async with`: entering, cleanup and the native context managers.
//!
//! The cleanup opcodes follow the layout the unwinder leaves behind. On entry to
//! `WITH_CLEANUP_START` the top of the stack is one of:
//!
//! - `None`: the body finished normally; `__exit__` is just below it.
//! - `Pending(Return | Continue)` over its operand, with `__exit__` below both.
//! - `Pending(Break)`: `__exit__` is just below it.
//! - `type, value, tb` of the exception, above the saved exception triple and
//!   `__exit__` seven slots down.

use super::{BlockKind, CallArgs, Frame, PendingUnwind, VM, generator::exact_args};
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{AIterWrapper, ContextManager, MethodKind},
    value::Value,
};

/// The state of a native context manager needed to run one of its methods.
enum CmState {
    Suppress(Vec<ExcType>),
    Null(Value),
    Generator(HeapId),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Looks up a special method on the type of `obj`, bound to `obj`.
    ///
    /// A missing method raises `AttributeError` carrying just the method name.
    fn special_method(&mut self, obj: &Value, name: &'static str) -> RunResult<Value> {
        match self.native_method(obj, name) {
            Some(method) => self.bind_native(obj, method),
            None => Err(crate::exception_private::SimpleException::new_msg(ExcType::AttributeError, name).into()),
        }
    }

    /// Replaces the manager on top of the stack with its bound exit method and
    /// returns the result of calling its enter method.
    fn enter_context(&mut self, frame: &mut Frame, enter: &'static str, exit: &'static str) -> RunResult<Value> {
        let enter = self.special_method(frame.top(), enter)?;
        let exit = match self.special_method(frame.top(), exit) {
            Ok(exit) => exit,
            Err(e) => {
                enter.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let manager = frame.replace(1, exit);
        manager.drop_with_heap(self.heap);
        let result = self.call_value(&enter, CallArgs::default());
        enter.drop_with_heap(self.heap);
        result
    }

    /// `SETUP_WITH`.
    pub(super) fn setup_with(&mut self, frame: &mut Frame, delta: usize) -> RunResult<()> {
        let entered = self.enter_context(frame, "__enter__", "__exit__")?;
        let target = frame.ip + delta;
        if let Err(e) = self.setup_block(frame, BlockKind::Finally, target) {
            entered.drop_with_heap(self.heap);
            return Err(e);
        }
        frame.push(entered);
        Ok(())
    }

    /// `BEFORE_ASYNC_WITH`: pushes the awaitable returned by `__aenter__`.
    pub(super) fn before_async_with(&mut self, frame: &mut Frame) -> RunResult<()> {
        let awaitable = self.enter_context(frame, "__aenter__", "__aexit__")?;
        frame.push(awaitable);
        Ok(())
    }

    /// `SETUP_ASYNC_WITH`: the awaited `__aenter__` result is on top.
    pub(super) fn setup_async_with(&mut self, frame: &mut Frame, delta: usize) -> RunResult<()> {
        let entered = frame.pop();
        let target = frame.ip + delta;
        if let Err(e) = self.setup_block(frame, BlockKind::Finally, target) {
            entered.drop_with_heap(self.heap);
            return Err(e);
        }
        frame.push(entered);
        Ok(())
    }

    /// `WITH_CLEANUP_START`: removes `__exit__` from the stack, calls it and
    /// pushes the exception type (or `None`) followed by its result.
    pub(super) fn with_cleanup_start(&mut self, frame: &mut Frame) -> RunResult<()> {
        let (exit, exc, args) = match frame.top() {
            Value::None => {
                let none = frame.pop();
                let exit = frame.replace(1, none);
                (exit, Value::None, [Value::None, Value::None, Value::None])
            }
            Value::Pending(PendingUnwind::Return | PendingUnwind::Continue) => {
                let pending = frame.pop();
                let operand = frame.pop();
                let exit = frame.replace(1, operand);
                frame.push(pending);
                (exit, Value::None, [Value::None, Value::None, Value::None])
            }
            Value::Pending(_) => {
                let pending = frame.pop();
                let exit = frame.replace(1, pending);
                (exit, Value::None, [Value::None, Value::None, Value::None])
            }
            _ => {
                let exc = frame.peek(1).clone_with_heap(self.heap);
                let args = [
                    frame.peek(1).clone_with_heap(self.heap),
                    frame.peek(2).clone_with_heap(self.heap),
                    frame.peek(3).clone_with_heap(self.heap),
                ];
                // slide the saved triple over `__exit__`, leaving a hole for the handler to drop
                let saved_type = frame.replace(4, Value::Undefined);
                let saved_value = frame.replace(5, saved_type);
                let saved_tb = frame.replace(6, saved_value);
                let exit = frame.replace(7, saved_tb);
                match frame.blocks.last_mut() {
                    Some(block) if block.kind == BlockKind::ExceptHandler => block.level -= 1,
                    _ => {
                        [exc, exit].drop_with_heap(self.heap);
                        args.drop_with_heap(self.heap);
                        return Err(RunError::internal("WITH_CLEANUP_START without an except handler"));
                    }
                }
                (exit, exc, args)
            }
        };
        let result = self.call_value(&exit, CallArgs::positional(args.into()));
        exit.drop_with_heap(self.heap);
        match result {
            Ok(result) => {
                frame.push(exc);
                frame.push(result);
                Ok(())
            }
            Err(e) => {
                exc.drop_with_heap(self.heap);
                Err(e)
            }
        }
    }

    /// `WITH_CLEANUP_FINISH`: a true `__exit__` result silences the exception.
    ///
    /// A failing truth test of the result replaces the exception being handled.
    pub(super) fn with_cleanup_finish(&mut self, frame: &mut Frame) -> RunResult<()> {
        let result = frame.pop();
        let exc = frame.pop();
        let silenced = if exc.is_none() { Ok(false) } else { self.is_true(&result) };
        [result, exc].drop_with_heap(self.heap);
        if silenced? {
            frame.push(Value::Pending(PendingUnwind::Silenced));
        }
        Ok(())
    }

    // ========================================================================
    // Native context managers
    // ========================================================================

    fn cm_state(&mut self, receiver: &Value) -> RunResult<CmState> {
        let state = match receiver.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::ContextManager(ContextManager::Suppress(types))) => CmState::Suppress(types.clone()),
            Some(HeapData::ContextManager(ContextManager::NullContext(value))) => {
                CmState::Null(value.copy_for_extend())
            }
            Some(HeapData::ContextManager(ContextManager::Generator(id))) => CmState::Generator(*id),
            _ => return Err(RunError::internal("context manager method on a non context manager")),
        };
        if let CmState::Null(Value::Ref(id)) = &state {
            self.heap.inc_ref(*id);
        }
        Ok(state)
    }

    /// `__enter__`, `__exit__`, `__aenter__` and `__aexit__` of the contextlib managers.
    pub(crate) fn call_cm_method(&mut self, method: MethodKind, receiver: &Value, args: Vec<Value>) -> RunResult<Value> {
        let name: &'static str = method.into();
        match method {
            MethodKind::CmEnter => {
                let [] = exact_args(self, name, args)?;
                self.cm_enter(receiver)
            }
            MethodKind::CmExit => {
                let [typ, val, tb] = exact_args(self, name, args)?;
                self.cm_exit(receiver, typ, val, tb)
            }
            MethodKind::CmAenter => {
                let [] = exact_args(self, name, args)?;
                let value = self.cm_enter(receiver)?;
                self.alloc(HeapData::AIterWrapper(AIterWrapper { value }))
            }
            MethodKind::CmAexit => {
                let [typ, val, tb] = exact_args(self, name, args)?;
                let value = self.cm_exit(receiver, typ, val, tb)?;
                self.alloc(HeapData::AIterWrapper(AIterWrapper { value }))
            }
            _ => {
                args.drop_with_heap(self.heap);
                Err(RunError::internal("not a context manager method"))
            }
        }
    }

    fn cm_enter(&mut self, receiver: &Value) -> RunResult<Value> {
        match self.cm_state(receiver)? {
            CmState::Suppress(_) => Ok(Value::None),
            CmState::Null(value) => Ok(value),
            CmState::Generator(gen_id) => match self.gen_send_ex(gen_id, Value::None, None, false)? {
                super::GenStep::Yielded(value) => Ok(value),
                super::GenStep::Returned(value) => {
                    value.drop_with_heap(self.heap);
                    Err(ExcType::runtime_error("generator didn't yield"))
                }
            },
        }
    }

    /// Runs `__exit__(typ, val, tb)`, consuming the three arguments.
    fn cm_exit(&mut self, receiver: &Value, typ: Value, val: Value, tb: Value) -> RunResult<Value> {
        let state = match self.cm_state(receiver) {
            Ok(state) => state,
            Err(e) => {
                [typ, val, tb].drop_with_heap(self.heap);
                return Err(e);
            }
        };
        match state {
            CmState::Suppress(types) => {
                let suppressed = match &typ {
                    Value::ExcClass(raised) => types.iter().any(|t| raised.is_subclass_of(*t)),
                    _ => false,
                };
                [typ, val, tb].drop_with_heap(self.heap);
                Ok(Value::Bool(suppressed))
            }
            CmState::Null(value) => {
                [value, typ, val, tb].drop_with_heap(self.heap);
                Ok(Value::None)
            }
            CmState::Generator(gen_id) if typ.is_none() => {
                [typ, val, tb].drop_with_heap(self.heap);
                match self.gen_send_ex(gen_id, Value::None, None, false)? {
                    super::GenStep::Returned(value) => {
                        value.drop_with_heap(self.heap);
                        Ok(Value::Bool(false))
                    }
                    super::GenStep::Yielded(value) => {
                        value.drop_with_heap(self.heap);
                        Err(ExcType::runtime_error("generator didn't stop"))
                    }
                }
            }
            CmState::Generator(gen_id) => {
                let threw_stop = matches!(typ, Value::ExcClass(ExcType::StopIteration));
                let mut err = self.make_thrown(typ, val, tb)?;
                let thrown_id = match &mut err {
                    RunError::Exc(raise) => raise.normalize(self.heap).ok(),
                    _ => None,
                };
                match self.gen_throw(gen_id, err, true) {
                    Ok(super::GenStep::Returned(value)) => {
                        value.drop_with_heap(self.heap);
                        Ok(Value::Bool(true))
                    }
                    Ok(super::GenStep::Yielded(value)) => {
                        value.drop_with_heap(self.heap);
                        Err(ExcType::runtime_error("generator didn't stop after throw()"))
                    }
                    Err(e) => {
                        let raised = e.instance_id();
                        let same = thrown_id.is_some() && raised == thrown_id;
                        let converted = threw_stop
                            && e.matches(ExcType::RuntimeError, self.heap)
                            && raised.is_some_and(|id| match self.heap.get(id) {
                                HeapData::Exception(obj) => obj.cause.ref_id() == thrown_id,
                                _ => false,
                            });
                        if same || converted {
                            e.drop_with_heap(self.heap);
                            Ok(Value::Bool(false))
                        } else if e.matches(ExcType::StopIteration, self.heap) {
                            e.drop_with_heap(self.heap);
                            Ok(Value::Bool(true))
                        } else {
                            Err(e)
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, Exception, Object, Opcode, Runner};

    /// `with contextlib.suppress(<exc>): <body>; return "after"`
    fn run_suppress(exc: &str, body: impl FnOnce(&mut CodeBuilder)) -> Result<Object, Exception> {
        let mut b = CodeBuilder::module("<test>");
        b.load_const(0);
        b.load_none();
        b.import_name("contextlib");
        b.load_attr("suppress");
        b.load_name(exc);
        b.call_function(1);
        let cleanup = b.new_label();
        b.emit_jump(Opcode::SetupWith, cleanup);
        b.pop_top();
        body(&mut b);
        b.emit(Opcode::PopBlock);
        b.load_none();
        b.bind(cleanup);
        b.emit(Opcode::WithCleanupStart);
        b.emit(Opcode::WithCleanupFinish);
        b.emit(Opcode::EndFinally);
        b.load_const("after");
        b.return_value();
        Runner::new(b.build()).run_no_limits()
    }

    #[test]
    fn suppress_swallows_matching_exception() {
        let result = run_suppress("ZeroDivisionError", |b| {
            b.load_const(1);
            b.load_const(0);
            b.emit(Opcode::BinaryTrueDivide);
            b.pop_top();
        });
        assert_eq!(result.unwrap(), Object::Str("after".to_owned()));
    }

    #[test]
    fn suppress_lets_other_exceptions_through() {
        let err = run_suppress("KeyError", |b| {
            b.load_const(1);
            b.load_const(0);
            b.emit(Opcode::BinaryTrueDivide);
            b.pop_top();
        })
        .unwrap_err();
        assert_eq!(err.summary(), "ZeroDivisionError: division by zero");
    }

    #[test]
    fn normal_exit_runs_body() {
        let result = run_suppress("KeyError", |b| {
            b.load_const(5);
            b.store_name("x");
        });
        assert_eq!(result.unwrap(), Object::Str("after".to_owned()));
    }

    #[test]
    fn missing_enter_is_attribute_error() {
        let mut b = CodeBuilder::module("<test>");
        b.load_const(1);
        let cleanup = b.new_label();
        b.emit_jump(Opcode::SetupWith, cleanup);
        b.bind(cleanup);
        b.load_none();
        b.return_value();
        let err = Runner::new(b.build()).run_no_limits().unwrap_err();
        assert_eq!(err.summary(), "AttributeError: __enter__");
    }

    #[test]
    fn exit_result_that_cannot_be_truth_tested_raises() {
        // The pending-return marker lands where the `__exit__` result is expected,
        // with the return value in the exception slot.
        let mut b = CodeBuilder::module("<test>");
        let fin = b.new_label();
        b.emit_jump(Opcode::SetupFinally, fin);
        b.load_const(1);
        b.return_value();
        b.bind(fin);
        b.emit(Opcode::WithCleanupFinish);
        b.load_const("after");
        b.return_value();
        let err = Runner::new(b.build()).run_no_limits().unwrap_err();
        assert_eq!(err.summary(), "SystemError: truth test of a non-object");
    }
}
