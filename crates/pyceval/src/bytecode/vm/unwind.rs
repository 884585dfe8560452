//! The block stack: unwinding, handler entry, `END_FINALLY` and `raise`.

use super::{Block, BlockKind, ExcInfo, Frame, FrameExit, PendingUnwind, VM, Why};
use crate::{
    exception_private::{ExcType, ExceptionRaise, RunError, RunResult, SimpleException, TraceFrame},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::ExceptionObject,
    value::Value,
};

fn block_name(kind: BlockKind) -> &'static str {
    match kind {
        BlockKind::Loop => "loop",
        BlockKind::Except => "except",
        BlockKind::Finally => "finally",
        BlockKind::ExceptHandler => "except handler",
    }
}

fn cannot_catch() -> RunError {
    ExcType::type_error("catching classes that do not inherit from BaseException is not allowed")
}

fn not_an_except_handler() -> RunError {
    ExcType::system_error("popped block is not an except handler")
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn setup_block(&mut self, frame: &mut Frame, kind: BlockKind, handler: usize) -> RunResult<()> {
        frame.push_block(kind, handler)?;
        self.tracer.on_block_push(block_name(kind), frame.blocks.len());
        Ok(())
    }

    fn pop_block_traced(&mut self, frame: &mut Frame) -> RunResult<Block> {
        let block = frame.pop_block()?;
        self.tracer.on_block_pop(block_name(block.kind), frame.blocks.len());
        Ok(block)
    }

    /// `POP_BLOCK`: leaves a loop, `try` or `with` body normally.
    pub(super) fn pop_block(&mut self, frame: &mut Frame) -> RunResult<()> {
        let block = self.pop_block_traced(frame)?;
        frame.unwind_stack(block.level, self.heap);
        Ok(())
    }

    /// `POP_EXCEPT`: leaves an `except` clause, restoring the previously handled exception.
    pub(super) fn pop_except(&mut self, frame: &mut Frame) -> RunResult<()> {
        let block = self.pop_block_traced(frame)?;
        if block.kind != BlockKind::ExceptHandler {
            return Err(not_an_except_handler());
        }
        self.unwind_except_handler(frame, block)
    }

    /// Drops everything an `ExceptHandler` block left above its saved triple,
    /// then pops the triple back into the "exception being handled" slot.
    pub(super) fn unwind_except_handler(&mut self, frame: &mut Frame, block: Block) -> RunResult<()> {
        if frame.stack.len() < block.level + 3 {
            return Err(RunError::internal("except handler block lost its saved exception"));
        }
        frame.unwind_stack(block.level + 3, self.heap);
        let exc_type = frame.pop();
        let value = frame.pop();
        let traceback = frame.pop();
        let previous = std::mem::replace(
            &mut self.exc_info,
            ExcInfo {
                exc_type,
                value,
                traceback,
            },
        );
        previous.drop_with_heap(self.heap);
        Ok(())
    }

    /// Walks the block stack on behalf of `why`.
    ///
    /// Returns `Ok(None)` when a block took over and execution continues in this
    /// frame, `Ok(Some(exit))` when the frame returns, and `Err` when an exception
    /// leaves the frame. Internal errors and resource-limit errors skip every handler.
    pub(super) fn unwind(&mut self, frame: &mut Frame, why: Why) -> RunResult<Option<FrameExit>> {
        let mut why = match why {
            Why::Exception(err @ (RunError::Internal(_) | RunError::UncatchableExc(_))) => {
                frame.unwind_stack(0, self.heap);
                return Err(err);
            }
            Why::Thrown(err) | Why::Reraise(err) => Why::Exception(err),
            other => other,
        };

        while let Some(block) = frame.blocks.last().copied() {
            if block.kind == BlockKind::Loop
                && let Why::Continue(target) = why
            {
                frame.ip = target;
                self.tracer.on_unwind("continue", target);
                return Ok(None);
            }
            frame.blocks.pop();
            self.tracer.on_block_pop(block_name(block.kind), frame.blocks.len());

            if block.kind == BlockKind::ExceptHandler {
                if let Err(e) = self.unwind_except_handler(frame, block) {
                    why.drop_with_heap(self.heap);
                    return Err(e);
                }
                continue;
            }
            frame.unwind_stack(block.level, self.heap);

            why = match (block.kind, why) {
                (BlockKind::Loop, Why::Break) => {
                    frame.ip = block.handler;
                    self.tracer.on_unwind("break", block.handler);
                    return Ok(None);
                }
                (BlockKind::Except | BlockKind::Finally, Why::Exception(RunError::Exc(raise))) => {
                    self.enter_handler(frame, block, raise)?;
                    return Ok(None);
                }
                (BlockKind::Finally, pending @ (Why::Return(_) | Why::Continue(_) | Why::Break)) => {
                    let reason = match pending {
                        Why::Return(value) => {
                            frame.push(value);
                            frame.push(Value::Pending(PendingUnwind::Return));
                            "return"
                        }
                        Why::Continue(target) => {
                            frame.push(Value::Int(i64::try_from(target).unwrap_or(i64::MAX)));
                            frame.push(Value::Pending(PendingUnwind::Continue));
                            "continue"
                        }
                        _ => {
                            frame.push(Value::Pending(PendingUnwind::Break));
                            "break"
                        }
                    };
                    frame.ip = block.handler;
                    self.tracer.on_unwind(reason, block.handler);
                    return Ok(None);
                }
                (_, other) => other,
            };
        }

        frame.unwind_stack(0, self.heap);
        match why {
            Why::Return(value) => Ok(Some(FrameExit::Return(value))),
            Why::Yield(value) => Ok(Some(FrameExit::Yield(value))),
            Why::Exception(err) | Why::Thrown(err) | Why::Reraise(err) => Err(err),
            Why::Break | Why::Continue(_) => Err(ExcType::system_error("error return without exception set")),
        }
    }

    /// Transfers control to an `except`/`finally` handler.
    ///
    /// Pushes an `ExceptHandler` block, saves the previously handled exception
    /// below it, makes the caught exception current and pushes `tb, value, type`
    /// for the handler code.
    fn enter_handler(&mut self, frame: &mut Frame, block: Block, mut raise: Box<ExceptionRaise>) -> RunResult<()> {
        let exc_id = match raise.normalize(self.heap) {
            Ok(id) => id,
            Err(e) => {
                raise.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let exc_type = raise.exc_type(self.heap);
        // the raise's reference to the instance moves into `value`
        let ExceptionRaise { traceback, .. } = *raise;
        let value = Value::Ref(exc_id);
        let traceback = if traceback.is_empty() {
            Value::None
        } else {
            match self.heap.allocate(HeapData::Traceback(traceback)) {
                Ok(id) => Value::Ref(id),
                Err(e) => {
                    value.drop_with_heap(self.heap);
                    return Err(e.into());
                }
            }
        };

        frame.blocks.push(Block {
            kind: BlockKind::ExceptHandler,
            handler: 0,
            level: frame.stack.len(),
        });
        self.tracer.on_block_push(block_name(BlockKind::ExceptHandler), frame.blocks.len());

        let previous = self.exc_info.take();
        frame.push(previous.traceback);
        frame.push(previous.value);
        frame.push(if previous.exc_type.is_undefined() {
            Value::None
        } else {
            previous.exc_type
        });

        let tb_for_instance = traceback.clone_with_heap(self.heap);
        let stale = match self.heap.get_mut(exc_id) {
            HeapData::Exception(exc) => std::mem::replace(&mut exc.traceback, tb_for_instance),
            _ => tb_for_instance,
        };
        stale.drop_with_heap(self.heap);

        self.exc_info = ExcInfo {
            exc_type: Value::ExcClass(exc_type),
            value: value.clone_with_heap(self.heap),
            traceback: traceback.clone_with_heap(self.heap),
        };
        frame.push(traceback);
        frame.push(value);
        frame.push(Value::ExcClass(exc_type));
        frame.ip = block.handler;
        self.tracer.on_unwind("exception", block.handler);
        Ok(())
    }

    /// `END_FINALLY`: resumes whatever sent control into the `finally` clause.
    pub(super) fn end_finally(&mut self, frame: &mut Frame) -> Result<(), Why> {
        match frame.pop() {
            Value::None => Ok(()),
            Value::Pending(PendingUnwind::Return) => Err(Why::Return(frame.pop())),
            Value::Pending(PendingUnwind::Continue) => match frame.pop() {
                Value::Int(target) => {
                    let target = usize::try_from(target).map_err(|_| RunError::internal("negative continue target"))?;
                    Err(Why::Continue(target))
                }
                other => {
                    other.drop_with_heap(self.heap);
                    Err(RunError::internal("continue target is not an offset").into())
                }
            },
            Value::Pending(PendingUnwind::Break) => Err(Why::Break),
            Value::Pending(PendingUnwind::Silenced) => {
                let block = self.pop_block_traced(frame)?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(not_an_except_handler().into());
                }
                self.unwind_except_handler(frame, block)?;
                Ok(())
            }
            Value::ExcClass(_) => {
                let value = frame.pop();
                let traceback = frame.pop();
                let frames = self.traceback_frames(&traceback);
                traceback.drop_with_heap(self.heap);
                match value {
                    Value::Ref(id) if matches!(self.heap.get(id), HeapData::Exception(_)) => {
                        let mut raise = ExceptionRaise::from_instance(id, frames);
                        raise.chained = true;
                        Err(Why::Reraise(raise.into()))
                    }
                    other => {
                        other.drop_with_heap(self.heap);
                        Err(RunError::internal("END_FINALLY found a class without an instance").into())
                    }
                }
            }
            other => {
                other.drop_with_heap(self.heap);
                Err(ExcType::system_error("'finally' pops bad exception").into())
            }
        }
    }

    /// Frames stored in a heap traceback, innermost first.
    pub(crate) fn traceback_frames(&self, traceback: &Value) -> Vec<TraceFrame> {
        match traceback {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Traceback(frames) => frames.clone(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// `RAISE_VARARGS`: `raise`, `raise exc` and `raise exc from cause`.
    pub(super) fn raise_varargs(&mut self, frame: &mut Frame, argc: usize) -> Why {
        match argc {
            0 => self.reraise_current(),
            1 => {
                let exc = frame.pop();
                Why::Exception(self.make_raise(exc, None))
            }
            2 => {
                let cause = frame.pop();
                let exc = frame.pop();
                Why::Exception(self.make_raise(exc, Some(cause)))
            }
            _ => Why::Exception(ExcType::system_error("bad RAISE_VARARGS oparg")),
        }
    }

    /// Bare `raise`: re-raises the exception being handled with its traceback intact.
    fn reraise_current(&mut self) -> Why {
        if !self.exc_info.is_active() {
            return Why::Exception(ExcType::runtime_error("No active exception to reraise"));
        }
        let mut raise = match &self.exc_info.value {
            Value::Ref(id) => {
                let id = *id;
                self.heap.inc_ref(id);
                let frames = self.traceback_frames(&self.exc_info.traceback);
                ExceptionRaise::from_instance(id, frames)
            }
            _ => match &self.exc_info.exc_type {
                Value::ExcClass(exc_type) => SimpleException::new_none(*exc_type).into(),
                _ => return Why::Exception(ExcType::runtime_error("No active exception to reraise")),
            },
        };
        raise.chained = true;
        Why::Reraise(raise.into())
    }

    /// Builds the error for `raise exc [from cause]`, consuming both operands.
    fn make_raise(&mut self, exc: Value, cause: Option<Value>) -> RunError {
        let exc_id = match self.exception_instance(exc) {
            Ok(Some(id)) => id,
            Ok(None) => {
                cause.drop_with_heap(self.heap);
                return ExcType::type_error("exceptions must derive from BaseException");
            }
            Err(e) => {
                cause.drop_with_heap(self.heap);
                return e;
            }
        };
        if let Some(cause) = cause {
            let fixed = match cause {
                Value::None => Ok(Value::None),
                other => match self.exception_instance(other) {
                    Ok(Some(id)) => Ok(Value::Ref(id)),
                    Ok(None) => Err(ExcType::type_error("exception causes must derive from BaseException")),
                    Err(e) => Err(e),
                },
            };
            let fixed = match fixed {
                Ok(fixed) => fixed,
                Err(e) => {
                    self.heap.dec_ref(exc_id);
                    return e;
                }
            };
            let old = match self.heap.get_mut(exc_id) {
                HeapData::Exception(obj) => {
                    obj.suppress_context = true;
                    std::mem::replace(&mut obj.cause, fixed)
                }
                _ => fixed,
            };
            old.drop_with_heap(self.heap);
        }
        let existing_tb = match self.heap.get(exc_id) {
            HeapData::Exception(obj) => self.traceback_frames(&obj.traceback),
            _ => Vec::new(),
        };
        ExceptionRaise::from_instance(exc_id, existing_tb).into()
    }

    /// Turns an exception class (instantiated without arguments) or instance
    /// into an owned instance id. `Ok(None)` for anything else; the value is consumed.
    fn exception_instance(&mut self, value: Value) -> RunResult<Option<HeapId>> {
        match value {
            Value::ExcClass(exc_type) => Ok(Some(
                self.heap
                    .allocate(HeapData::Exception(ExceptionObject::new(exc_type, Vec::new())))?,
            )),
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Exception(_)) => Ok(Some(id)),
            other => {
                other.drop_with_heap(self.heap);
                Ok(None)
            }
        }
    }

    /// `COMPARE_OP exception-match`: does the raised class match the `except` clause?
    ///
    /// The clause must be an exception class or a tuple of them.
    pub(super) fn exception_matches(&self, exc: &Value, handler: &Value) -> RunResult<bool> {
        let handlers: Vec<ExcType> = match handler {
            Value::ExcClass(exc_type) => vec![*exc_type],
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::ExcClass(exc_type) => Some(*exc_type),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(cannot_catch)?,
                _ => return Err(cannot_catch()),
            },
            _ => return Err(cannot_catch()),
        };
        let raised = match exc {
            Value::ExcClass(exc_type) => *exc_type,
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Exception(obj) => obj.exc_type,
                _ => return Ok(false),
            },
            _ => return Ok(false),
        };
        Ok(handlers.iter().any(|h| raised.is_subclass_of(*h)))
    }
}
