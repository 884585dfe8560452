//! Bytecode virtual machine.
//!
//! Every Python-level call evaluates its [`Frame`] in a nested call to
//! [`VM::eval_frame`]; a generator frame lives inside its generator object while
//! suspended and is moved back onto the Rust stack each time it resumes.
//!
//! Instructions never unwind the Rust stack themselves. An instruction that
//! leaves straight-line execution reports a [`Why`]; the loop records the
//! traceback entry, attaches the exception being handled as `__context__`, and
//! hands the outcome to the unwinder, which walks the frame's block stack.

mod attr;
mod binary;
mod call;
mod collections;
mod frame;
mod generator;
mod names;
mod unwind;
mod with;

use std::{rc::Rc, sync::Arc};

pub(crate) use call::CallArgs;
pub(crate) use frame::{Block, BlockKind, ExcInfo, Frame, FrameExit, PendingUnwind};
pub(crate) use generator::{GenStep, Next};
use strum::IntoEnumIterator;

use crate::{
    breaker::EvalBreaker,
    builtins::Builtins,
    bytecode::{Code, CodeFlags, CodeObject, Opcode},
    exception_private::{ExcType, ExceptionRaise, RunError, RunResult, TraceFrame},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    import::Importer,
    io::PrintWriter,
    resource::{ResourceError, ResourceTracker},
    tracer::VmTracer,
    types::{Dict, Module, dict_set_item},
    value::Value,
};

/// Why an instruction left straight-line execution.
#[derive(Debug)]
pub(crate) enum Why {
    /// The instruction failed.
    Exception(RunError),
    /// An exception injected by `throw()`. Recorded in the traceback, never chained.
    Thrown(RunError),
    /// Bare `raise` or `END_FINALLY` re-raising: the traceback already covers this frame.
    Reraise(RunError),
    Return(Value),
    Break,
    /// `continue` inside a `try` body; carries the loop's start offset.
    Continue(usize),
    Yield(Value),
}

impl From<RunError> for Why {
    fn from(err: RunError) -> Self {
        Self::Exception(err)
    }
}

impl From<ResourceError> for Why {
    fn from(err: ResourceError) -> Self {
        Self::Exception(err.into())
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Why {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        match self {
            Self::Exception(err) | Self::Thrown(err) | Self::Reraise(err) => err.drop_with_heap(heap),
            Self::Return(value) | Self::Yield(value) => value.drop_with_heap(heap),
            Self::Break | Self::Continue(_) => {}
        }
    }
}

/// Opcodes before which the eval breaker is not serviced.
fn defers_breaker(op: Option<Opcode>) -> bool {
    matches!(
        op,
        Some(Opcode::SetupFinally | Opcode::SetupWith | Opcode::BeforeAsyncWith | Opcode::YieldFrom)
    )
}

/// The evaluation engine for one run.
///
/// Owns the builtins and `sys.modules` dicts plus the "exception being handled"
/// triple. Borrowed collaborators (heap, print writer, tracer, importer) outlive it.
pub(crate) struct VM<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> {
    pub(crate) heap: &'a mut Heap<T>,
    pub(crate) print: &'a mut P,
    pub(crate) tracer: &'a mut Tr,
    breaker: Option<Arc<EvalBreaker>>,
    pub(crate) importer: &'a dyn Importer,
    pub(crate) builtins: HeapId,
    /// `sys.modules`: module name to module object.
    pub(crate) modules: HeapId,
    /// `sys.exc_info()` of the running frame.
    pub(crate) exc_info: ExcInfo,
    /// Number of frames currently evaluating.
    depth: usize,
    /// Module dicts created during the run. Functions reference their globals
    /// and globals reference the functions, so these are emptied at teardown.
    namespaces: Vec<HeapId>,
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'a, T, P, Tr> {
    pub fn new(
        heap: &'a mut Heap<T>,
        print: &'a mut P,
        tracer: &'a mut Tr,
        importer: &'a dyn Importer,
        breaker: Option<Arc<EvalBreaker>>,
    ) -> RunResult<Self> {
        let builtins = heap.allocate(HeapData::Dict(Dict::new()))?;
        let modules = match heap.allocate(HeapData::Dict(Dict::new())) {
            Ok(id) => id,
            Err(e) => {
                heap.dec_ref(builtins);
                return Err(e.into());
            }
        };
        let mut vm = Self {
            heap,
            print,
            tracer,
            breaker,
            importer,
            builtins,
            modules,
            exc_info: ExcInfo::empty(),
            depth: 0,
            namespaces: Vec::new(),
        };
        vm.populate_builtins()?;
        Ok(vm)
    }

    fn populate_builtins(&mut self) -> RunResult<()> {
        for builtin in Builtins::iter().filter(|b| b.is_global()) {
            let name: &'static str = builtin.into();
            let key = self.heap.alloc_str(name)?;
            dict_set_item(self.heap, self.builtins, key, Value::Builtin(builtin))?;
        }
        for exc_type in ExcType::iter() {
            let name: &'static str = exc_type.into();
            let key = self.heap.alloc_str(name)?;
            dict_set_item(self.heap, self.builtins, key, Value::ExcClass(exc_type))?;
        }
        Ok(())
    }

    /// Allocates a module dict with `__name__` set and registers it for teardown.
    ///
    /// The returned id is borrowed; the VM keeps the owning reference.
    pub(crate) fn new_namespace(&mut self, name: &str) -> RunResult<HeapId> {
        let dict = self.heap.allocate(HeapData::Dict(Dict::new()))?;
        self.namespaces.push(dict);
        let key = self.heap.alloc_str("__name__")?;
        let value = self.heap.alloc_str(name)?;
        dict_set_item(self.heap, dict, key, value)?;
        Ok(dict)
    }

    /// Wraps a namespace in a module object (new reference).
    pub(crate) fn new_module(&mut self, name: &str, dict: HeapId) -> RunResult<Value> {
        self.heap.inc_ref(dict);
        match self.heap.allocate(HeapData::Module(Module {
            name: name.to_owned(),
            dict,
        })) {
            Ok(id) => Ok(Value::Ref(id)),
            Err(e) => {
                self.heap.dec_ref(dict);
                Err(e.into())
            }
        }
    }

    /// Executes module-level code in a fresh `__main__` namespace.
    pub fn run_module(&mut self, code: Rc<Code>) -> RunResult<Value> {
        let globals = self.new_namespace("__main__")?;
        self.exec_code(code, globals)
    }

    /// Executes `code` with `globals` serving as both globals and locals.
    pub(crate) fn exec_code(&mut self, code: Rc<Code>, globals: HeapId) -> RunResult<Value> {
        code.validate().map_err(ExcType::system_error)?;
        let code_id = CodeObject::allocate(Rc::clone(&code), self.heap)?;
        let locals_dict = if code.flags.contains(CodeFlags::NEWLOCALS) {
            None
        } else {
            self.heap.inc_ref(globals);
            Some(globals)
        };
        self.heap.inc_ref(globals);
        self.heap.inc_ref(self.builtins);
        let mut frame = Frame::new(code, code_id, globals, self.builtins, locals_dict);
        let result = match self.init_cells(&mut frame, None) {
            Ok(()) => self.eval_frame(&mut frame, None),
            Err(e) => Err(e),
        };
        frame.drop_with_heap(self.heap);
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(value) => {
                value.drop_with_heap(self.heap);
                Err(RunError::internal("module-level code yielded"))
            }
        }
    }

    /// Releases everything the VM owns.
    ///
    /// Module dicts are emptied before being released so function/globals cycles
    /// do not keep each other alive.
    pub fn teardown(self) {
        let Self {
            heap,
            builtins,
            modules,
            exc_info,
            namespaces,
            ..
        } = self;
        exc_info.drop_with_heap(heap);
        for dict in namespaces.iter().copied().chain([modules]) {
            let entries: Vec<(Value, Value)> = match heap.get_mut(dict) {
                HeapData::Dict(d) => d.drain().map(|(_, pair)| pair).collect(),
                _ => Vec::new(),
            };
            entries.drop_with_heap(heap);
        }
        namespaces.drop_with_heap(heap);
        heap.dec_ref(modules);
        heap.dec_ref(builtins);
    }

    pub(crate) fn alloc(&mut self, data: HeapData) -> RunResult<Value> {
        Ok(Value::Ref(self.heap.allocate(data)?))
    }

    // ========================================================================
    // Frame evaluation
    // ========================================================================

    /// Evaluates `frame` until it returns, raises or yields.
    ///
    /// `throw` injects an exception at the current instruction, as
    /// `generator.throw()` does. Resumable frames keep their own view of the
    /// exception being handled: it is swapped in here and swapped back out on exit.
    pub(crate) fn eval_frame(&mut self, frame: &mut Frame, throw: Option<RunError>) -> RunResult<FrameExit> {
        if let Err(err) = self.heap.tracker().check_recursion_depth(self.depth) {
            throw.drop_with_heap(self.heap);
            return Err(err.into());
        }
        self.depth += 1;
        if frame.started {
            self.tracer.on_resume(&frame.code.name, self.depth);
        } else {
            self.tracer.on_call(&frame.code.name, self.depth);
        }

        let resumable = frame.code.flags.is_resumable();
        if resumable {
            if throw.is_none() && frame.exc_state.is_active() {
                std::mem::swap(&mut self.exc_info, &mut frame.exc_state);
            } else {
                let saved = self.exc_info.clone_with_heap(self.heap);
                std::mem::replace(&mut frame.exc_state, saved).drop_with_heap(self.heap);
            }
        }
        frame.started = true;

        let result = self.run_frame(frame, throw);

        if resumable {
            if frame.in_handler() {
                std::mem::swap(&mut self.exc_info, &mut frame.exc_state);
            } else {
                let restored = frame.exc_state.take();
                std::mem::replace(&mut self.exc_info, restored).drop_with_heap(self.heap);
            }
        }
        self.depth -= 1;
        if matches!(result, Ok(FrameExit::Yield(_))) {
            self.tracer.on_yield(self.depth);
        }
        self.tracer.on_return(self.depth);
        result
    }

    fn run_frame(&mut self, frame: &mut Frame, throw: Option<RunError>) -> RunResult<FrameExit> {
        let mut pending = throw.map(Why::Thrown);
        loop {
            let why = match pending.take() {
                Some(why) => why,
                None => match self.step(frame) {
                    Ok(()) => continue,
                    Err(why) => why,
                },
            };
            let why = match why {
                Why::Yield(value) => return Ok(FrameExit::Yield(value)),
                Why::Exception(err) => Why::Exception(self.record_error(frame, err, true)),
                Why::Thrown(err) => Why::Exception(self.record_error(frame, err, false)),
                Why::Reraise(mut err) => {
                    if let RunError::Exc(raise) = &mut err {
                        raise.chained = true;
                    }
                    Why::Exception(err)
                }
                other => other,
            };
            if let Some(exit) = self.unwind(frame, why)? {
                return Ok(exit);
            }
        }
    }

    /// The `error:` label: adds this frame to the traceback and, for freshly
    /// raised exceptions, attaches the exception being handled as `__context__`.
    fn record_error(&mut self, frame: &Frame, mut err: RunError, chain: bool) -> RunError {
        if let Some(traceback) = err.traceback_mut() {
            traceback.push(TraceFrame {
                filename: frame.code.filename.clone(),
                name: frame.code.name.clone(),
                line: frame.line(),
            });
        }
        if let Some(exc_type) = err.exc_type(self.heap) {
            self.tracer.on_exception(exc_type, self.depth);
        }
        let failed = match &mut err {
            RunError::Exc(raise) => {
                let failed = if chain && !raise.chained {
                    self.chain_context(raise).err()
                } else {
                    None
                };
                raise.chained = true;
                failed
            }
            _ => None,
        };
        if let Some(failure) = failed {
            err.drop_with_heap(self.heap);
            return failure;
        }
        err
    }

    /// Implicit exception chaining: `raise` inside an `except` block records the
    /// handled exception as the new one's `__context__`.
    ///
    /// A context chain that already contains the new exception is cut there,
    /// so re-raising an earlier exception cannot create a cycle.
    pub(crate) fn chain_context(&mut self, raise: &mut ExceptionRaise) -> RunResult<()> {
        raise.chained = true;
        if !self.exc_info.is_active() {
            return Ok(());
        }
        let Some(handled) = self.exc_info.value.ref_id() else {
            return Ok(());
        };
        let new_id = raise.normalize(self.heap)?;
        if new_id == handled {
            return Ok(());
        }
        let mut cursor = handled;
        loop {
            let next = match self.heap.get(cursor) {
                HeapData::Exception(exc) => exc.context.ref_id(),
                _ => None,
            };
            let Some(next) = next else { break };
            if next == new_id {
                let cut = match self.heap.get_mut(cursor) {
                    HeapData::Exception(exc) => std::mem::replace(&mut exc.context, Value::None),
                    _ => Value::None,
                };
                cut.drop_with_heap(self.heap);
                break;
            }
            cursor = next;
        }
        self.heap.inc_ref(handled);
        let previous = match self.heap.get_mut(new_id) {
            HeapData::Exception(exc) => std::mem::replace(&mut exc.context, Value::Ref(handled)),
            _ => Value::Ref(handled),
        };
        previous.drop_with_heap(self.heap);
        Ok(())
    }

    /// Fetches, traces and executes one instruction.
    fn step(&mut self, frame: &mut Frame) -> Result<(), Why> {
        self.heap.tracker_mut().check_time()?;
        if let Some(breaker) = &self.breaker
            && breaker.is_requested()
            && !defers_breaker(frame.code.opcode_at(frame.ip))
        {
            self.tracer.on_breaker();
            breaker.service()?;
        }
        let (op, arg) = fetch(frame)?;
        self.tracer.on_instruction(frame.lasti, op, frame.stack.len(), self.depth);
        let result = self.execute(frame, op, arg);
        if frame.underflow.take() {
            if let Err(why) = result {
                why.drop_with_heap(self.heap);
            }
            return Err(ExcType::system_error("operand stack underflow").into());
        }
        result
    }

    #[expect(clippy::too_many_lines, reason = "one arm per opcode")]
    fn execute(&mut self, frame: &mut Frame, op: Opcode, arg: u32) -> Result<(), Why> {
        use binary::{BinaryOp, UnaryOp};

        let oparg = arg as usize;
        match op {
            // ================================================================
            // Stack manipulation
            // ================================================================
            Opcode::Nop => {}
            Opcode::PopTop => frame.pop().drop_with_heap(self.heap),
            Opcode::RotTwo => frame.rotate(2),
            Opcode::RotThree => frame.rotate(3),
            Opcode::DupTop => {
                let top = frame.top().clone_with_heap(self.heap);
                frame.push(top);
            }
            Opcode::DupTopTwo => {
                let second = frame.peek(2).clone_with_heap(self.heap);
                let top = frame.peek(1).clone_with_heap(self.heap);
                frame.push(second);
                frame.push(top);
            }
            Opcode::LoadConst => self.load_const(frame, oparg)?,

            // ================================================================
            // Operators
            // ================================================================
            Opcode::UnaryPositive => self.unary_op(frame, UnaryOp::Pos)?,
            Opcode::UnaryNegative => self.unary_op(frame, UnaryOp::Neg)?,
            Opcode::UnaryInvert => self.unary_op(frame, UnaryOp::Invert)?,
            Opcode::UnaryNot => {
                let value = frame.pop();
                let truth = self.truth_and_release(value)?;
                frame.push(Value::Bool(!truth));
            }
            Opcode::BinaryPower => self.binary_op(frame, BinaryOp::Pow, false)?,
            Opcode::BinaryMultiply => self.binary_op(frame, BinaryOp::Mul, false)?,
            Opcode::BinaryMatrixMultiply => self.binary_op(frame, BinaryOp::MatMul, false)?,
            Opcode::BinaryModulo => self.binary_op(frame, BinaryOp::Mod, false)?,
            Opcode::BinaryAdd => self.binary_op(frame, BinaryOp::Add, false)?,
            Opcode::BinarySubtract => self.binary_op(frame, BinaryOp::Sub, false)?,
            Opcode::BinaryFloorDivide => self.binary_op(frame, BinaryOp::FloorDiv, false)?,
            Opcode::BinaryTrueDivide => self.binary_op(frame, BinaryOp::TrueDiv, false)?,
            Opcode::BinaryLshift => self.binary_op(frame, BinaryOp::LShift, false)?,
            Opcode::BinaryRshift => self.binary_op(frame, BinaryOp::RShift, false)?,
            Opcode::BinaryAnd => self.binary_op(frame, BinaryOp::And, false)?,
            Opcode::BinaryXor => self.binary_op(frame, BinaryOp::Xor, false)?,
            Opcode::BinaryOr => self.binary_op(frame, BinaryOp::Or, false)?,
            Opcode::InplacePower => self.binary_op(frame, BinaryOp::Pow, true)?,
            Opcode::InplaceMultiply => self.binary_op(frame, BinaryOp::Mul, true)?,
            Opcode::InplaceMatrixMultiply => self.binary_op(frame, BinaryOp::MatMul, true)?,
            Opcode::InplaceModulo => self.binary_op(frame, BinaryOp::Mod, true)?,
            Opcode::InplaceAdd => self.binary_op(frame, BinaryOp::Add, true)?,
            Opcode::InplaceSubtract => self.binary_op(frame, BinaryOp::Sub, true)?,
            Opcode::InplaceFloorDivide => self.binary_op(frame, BinaryOp::FloorDiv, true)?,
            Opcode::InplaceTrueDivide => self.binary_op(frame, BinaryOp::TrueDiv, true)?,
            Opcode::InplaceLshift => self.binary_op(frame, BinaryOp::LShift, true)?,
            Opcode::InplaceRshift => self.binary_op(frame, BinaryOp::RShift, true)?,
            Opcode::InplaceAnd => self.binary_op(frame, BinaryOp::And, true)?,
            Opcode::InplaceXor => self.binary_op(frame, BinaryOp::Xor, true)?,
            Opcode::InplaceOr => self.binary_op(frame, BinaryOp::Or, true)?,
            Opcode::BinarySubscr => self.binary_subscr(frame)?,
            Opcode::StoreSubscr => self.store_subscr(frame)?,
            Opcode::DeleteSubscr => self.delete_subscr(frame)?,
            Opcode::CompareOp => self.compare_op(frame, arg)?,

            // ================================================================
            // Control flow
            // ================================================================
            Opcode::JumpForward => frame.ip += oparg,
            Opcode::JumpAbsolute => frame.ip = oparg,
            Opcode::PopJumpIfFalse => {
                let value = frame.pop();
                if !self.truth_and_release(value)? {
                    frame.ip = oparg;
                }
            }
            Opcode::PopJumpIfTrue => {
                let value = frame.pop();
                if self.truth_and_release(value)? {
                    frame.ip = oparg;
                }
            }
            Opcode::JumpIfFalseOrPop => {
                if self.is_true(frame.top())? {
                    frame.pop().drop_with_heap(self.heap);
                } else {
                    frame.ip = oparg;
                }
            }
            Opcode::JumpIfTrueOrPop => {
                if self.is_true(frame.top())? {
                    frame.ip = oparg;
                } else {
                    frame.pop().drop_with_heap(self.heap);
                }
            }
            Opcode::ReturnValue => return Err(Why::Return(frame.pop())),
            Opcode::BreakLoop => return Err(Why::Break),
            Opcode::ContinueLoop => return Err(Why::Continue(oparg)),

            // ================================================================
            // Blocks and exceptions
            // ================================================================
            Opcode::SetupLoop => {
                let target = frame.ip + oparg;
                self.setup_block(frame, BlockKind::Loop, target)?;
            }
            Opcode::SetupExcept => {
                let target = frame.ip + oparg;
                self.setup_block(frame, BlockKind::Except, target)?;
            }
            Opcode::SetupFinally => {
                let target = frame.ip + oparg;
                self.setup_block(frame, BlockKind::Finally, target)?;
            }
            Opcode::PopBlock => self.pop_block(frame)?,
            Opcode::PopExcept => self.pop_except(frame)?,
            Opcode::EndFinally => self.end_finally(frame)?,
            Opcode::RaiseVarargs => return Err(self.raise_varargs(frame, oparg)),
            Opcode::SetupWith => self.setup_with(frame, oparg)?,
            Opcode::WithCleanupStart => self.with_cleanup_start(frame)?,
            Opcode::WithCleanupFinish => self.with_cleanup_finish(frame)?,
            Opcode::BeforeAsyncWith => self.before_async_with(frame)?,
            Opcode::SetupAsyncWith => self.setup_async_with(frame, oparg)?,

            // ================================================================
            // Names
            // ================================================================
            Opcode::LoadName => self.load_name(frame, oparg)?,
            Opcode::StoreName => self.store_name(frame, oparg)?,
            Opcode::DeleteName => self.delete_name(frame, oparg)?,
            Opcode::LoadGlobal => self.load_global(frame, oparg)?,
            Opcode::StoreGlobal => self.store_global(frame, oparg)?,
            Opcode::DeleteGlobal => self.delete_global(frame, oparg)?,
            Opcode::LoadFast => self.load_fast(frame, oparg)?,
            Opcode::StoreFast => {
                let value = frame.pop();
                std::mem::replace(&mut frame.locals[oparg], value).drop_with_heap(self.heap);
            }
            Opcode::DeleteFast => self.delete_fast(frame, oparg)?,
            Opcode::LoadDeref => self.load_deref(frame, oparg)?,
            Opcode::StoreDeref => {
                let value = frame.pop();
                self.heap.cell_set(frame.cells[oparg], value);
            }
            Opcode::DeleteDeref => self.delete_deref(frame, oparg)?,
            Opcode::LoadClosure => {
                let cell = frame.cells[oparg];
                self.heap.inc_ref(cell);
                frame.push(Value::Ref(cell));
            }
            Opcode::LoadClassderef => self.load_classderef(frame, oparg)?,
            Opcode::SetupAnnotations => self.setup_annotations(frame)?,
            Opcode::StoreAnnotation => self.store_annotation(frame, oparg)?,
            Opcode::LoadBuildClass => self.load_build_class(frame)?,

            // ================================================================
            // Attributes and imports
            // ================================================================
            Opcode::LoadAttr => self.load_attr_op(frame, oparg)?,
            Opcode::StoreAttr => self.store_attr_op(frame, oparg)?,
            Opcode::DeleteAttr => self.delete_attr_op(frame, oparg)?,
            Opcode::ImportName => self.import_name_op(frame, oparg)?,
            Opcode::ImportFrom => self.import_from_op(frame, oparg)?,
            Opcode::ImportStar => self.import_star_op(frame)?,

            // ================================================================
            // Containers and iteration
            // ================================================================
            Opcode::BuildTuple => {
                let items = frame.pop_n(oparg);
                frame.push(self.heap.alloc_tuple(items)?);
            }
            Opcode::BuildList => {
                let items = frame.pop_n(oparg);
                frame.push(self.heap.alloc_list(items)?);
            }
            Opcode::BuildSet => self.build_set(frame, oparg)?,
            Opcode::BuildMap => self.build_map(frame, oparg)?,
            Opcode::BuildConstKeyMap => self.build_const_key_map(frame, oparg)?,
            Opcode::BuildString => self.build_string(frame, oparg)?,
            Opcode::BuildTupleUnpack | Opcode::BuildTupleUnpackWithCall | Opcode::BuildListUnpack => {
                self.build_sequence_unpack(frame, op, oparg)?;
            }
            Opcode::BuildSetUnpack => self.build_set_unpack(frame, oparg)?,
            Opcode::BuildMapUnpack => self.build_map_unpack(frame, oparg, false)?,
            Opcode::BuildMapUnpackWithCall => self.build_map_unpack(frame, oparg, true)?,
            Opcode::BuildSlice => self.build_slice(frame, oparg)?,
            Opcode::ListAppend => self.list_append(frame, oparg),
            Opcode::SetAdd => self.set_add(frame, oparg)?,
            Opcode::MapAdd => self.map_add(frame, oparg)?,
            Opcode::UnpackSequence => self.unpack_sequence(frame, oparg)?,
            Opcode::UnpackEx => self.unpack_ex(frame, oparg)?,
            Opcode::GetIter => self.get_iter_op(frame)?,
            Opcode::ForIter => self.for_iter(frame, oparg)?,
            Opcode::FormatValue => self.format_value_op(frame, arg)?,

            // ================================================================
            // Calls
            // ================================================================
            Opcode::CallFunction => self.call_function_op(frame, oparg)?,
            Opcode::CallFunctionKw => self.call_function_kw_op(frame, oparg)?,
            Opcode::CallFunctionEx => self.call_function_ex_op(frame, oparg)?,
            Opcode::MakeFunction => self.make_function(frame, arg)?,

            // ================================================================
            // Generators and coroutines
            // ================================================================
            Opcode::YieldValue => return Err(self.yield_value(frame)),
            Opcode::YieldFrom => self.yield_from(frame)?,
            Opcode::GetYieldFromIter => self.get_yield_from_iter(frame)?,
            Opcode::GetAwaitable => self.get_awaitable(frame)?,
            Opcode::GetAiter => self.get_aiter(frame)?,
            Opcode::GetAnext => self.get_anext(frame)?,

            // ================================================================
            // Misc
            // ================================================================
            Opcode::PrintExpr => self.print_expr(frame)?,
            Opcode::ExtendedArg => return Err(RunError::internal("EXTENDED_ARG reached dispatch").into()),
        }
        Ok(())
    }

    fn load_const(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let value = match self.heap.get(frame.code_id) {
            HeapData::Code(code) => code.consts.get(index).map(Value::copy_for_extend),
            _ => None,
        };
        let value = value.ok_or_else(|| RunError::internal("LOAD_CONST index out of range"))?;
        if let Value::Ref(id) = &value {
            self.heap.inc_ref(*id);
        }
        frame.push(value);
        Ok(())
    }

    /// Truth value of `value`, releasing it.
    /// Truth test of a value reaching a conditional.
    ///
    /// Unbound slots and unwind markers are not Python objects; testing one is a `SystemError`.
    fn is_true(&self, value: &Value) -> RunResult<bool> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Undefined | Value::Pending(_) => Err(ExcType::system_error("truth test of a non-object")),
            other => Ok(other.py_bool(self.heap)),
        }
    }

    fn truth_and_release(&mut self, value: Value) -> RunResult<bool> {
        let truth = self.is_true(&value);
        value.drop_with_heap(self.heap);
        truth
    }

    /// `PRINT_EXPR`: the interactive echo, as `sys.displayhook` does it.
    fn print_expr(&mut self, frame: &mut Frame) -> RunResult<()> {
        let value = frame.pop();
        if value.is_none() {
            return Ok(());
        }
        let text = value.py_repr(self.heap);
        let key = self.heap.alloc_str("_")?;
        dict_set_item(self.heap, self.builtins, key, value)?;
        self.print.write_text(text.into())?;
        self.print.write_char('\n')?;
        Ok(())
    }

    fn load_build_class(&mut self, frame: &mut Frame) -> RunResult<()> {
        let found = crate::types::dict_get_item(
            self.heap,
            frame.builtins,
            &crate::types::HashKey::str("__build_class__"),
        );
        match found {
            Some(value) => {
                frame.push(value);
                Ok(())
            }
            None => Err(crate::exception_private::SimpleException::new_msg(
                ExcType::NameError,
                "__build_class__ not found",
            )
            .into()),
        }
    }
}

/// Reads the next instruction, folding `EXTENDED_ARG` prefixes into its argument.
fn fetch(frame: &mut Frame) -> RunResult<(Opcode, u32)> {
    let mut arg: u32 = 0;
    loop {
        let Some(&[byte, raw]) = frame.code.bytecode.get(frame.ip..frame.ip + 2) else {
            return Err(RunError::internal("instruction pointer past the end of the code"));
        };
        frame.lasti = frame.ip;
        frame.ip += 2;
        arg |= u32::from(raw);
        match Opcode::try_from(byte) {
            Ok(Opcode::ExtendedArg) => arg <<= 8,
            Ok(op) => return Ok((op, arg)),
            Err(_) => return Err(ExcType::system_error("unknown opcode")),
        }
    }
}
