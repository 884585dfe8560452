//! The suspend/resume protocol shared by generators, coroutines and async generators.
//!
//! A generator's frame is moved out of the generator object for the duration of
//! each resumption and evaluated by a nested [`VM::eval_frame`]; `running` marks
//! the object busy in the meantime so re-entry is reported instead of recursing.
//! `YIELD_FROM` rewinds the instruction pointer onto itself when it suspends, so
//! the delegated sub-iterator of a suspended frame is the top of its stack.

use crate::{
    bytecode::{CodeFlags, Opcode},
    exception_private::{ExcType, ExceptionRaise, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{AIterWrapper, AsyncGenAwaitable, AwaitableMode, AwaitableState, ExceptionObject, GenKind, MethodKind},
    value::Value,
};

use super::{Frame, FrameExit, VM, Why};

/// Result of resuming a generator once.
#[derive(Debug)]
pub(crate) enum GenStep {
    Yielded(Value),
    /// The frame finished; carries its return value.
    Returned(Value),
}

/// Result of advancing an iterator or delegated sub-iterator.
#[derive(Debug)]
pub(crate) enum Next {
    Value(Value),
    /// Exhausted; carries the `StopIteration` value (`None` for plain iterators).
    Done(Value),
}

impl From<GenStep> for Next {
    fn from(step: GenStep) -> Self {
        match step {
            GenStep::Yielded(v) => Self::Value(v),
            GenStep::Returned(v) => Self::Done(v),
        }
    }
}

/// What `gen_send_ex` found before resuming.
enum Resume {
    Running,
    Finished,
    Unstarted,
    Suspended,
}

fn not_an_iterator(type_name: &str) -> RunError {
    ExcType::type_error(format!("'{type_name}' object is not an iterator"))
}

fn ignored_exit(kind: GenKind) -> RunError {
    ExcType::runtime_error(format!("{} ignored GeneratorExit", kind.noun()))
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    // ========================================================================
    // Core resume
    // ========================================================================

    /// Resumes the generator at `gen_id`, sending `arg` or injecting `throw`.
    ///
    /// `closing` is set by `close()`, which may legitimately target an
    /// already-finished coroutine.
    pub(crate) fn gen_send_ex(
        &mut self,
        gen_id: HeapId,
        arg: Value,
        throw: Option<RunError>,
        closing: bool,
    ) -> RunResult<GenStep> {
        let (kind, state) = match self.heap.get(gen_id) {
            HeapData::Generator(generator) => (
                generator.kind,
                if generator.running {
                    Resume::Running
                } else {
                    match &generator.frame {
                        None => Resume::Finished,
                        Some(frame) if frame.started => Resume::Suspended,
                        Some(_) => Resume::Unstarted,
                    }
                },
            ),
            _ => {
                arg.drop_with_heap(self.heap);
                throw.drop_with_heap(self.heap);
                return Err(RunError::internal("gen_send_ex on a non-generator"));
            }
        };

        match state {
            Resume::Running => {
                arg.drop_with_heap(self.heap);
                throw.drop_with_heap(self.heap);
                return Err(ExcType::value_error(format!("{} already executing", kind.noun())));
            }
            Resume::Finished => {
                arg.drop_with_heap(self.heap);
                if kind == GenKind::Coroutine && !closing {
                    throw.drop_with_heap(self.heap);
                    return Err(ExcType::runtime_error("cannot reuse already awaited coroutine"));
                }
                if let Some(err) = throw {
                    return Err(err);
                }
                if kind == GenKind::AsyncGenerator {
                    return Err(SimpleException::new_none(ExcType::StopAsyncIteration).into());
                }
                return Ok(GenStep::Returned(Value::None));
            }
            Resume::Unstarted if throw.is_none() && !arg.is_none() => {
                arg.drop_with_heap(self.heap);
                return Err(ExcType::type_error(format!(
                    "can't send non-None value to a just-started {}",
                    kind.noun()
                )));
            }
            Resume::Unstarted | Resume::Suspended => {}
        }

        let mut frame = match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => {
                generator.running = true;
                generator.frame.take()
            }
            _ => None,
        }
        .ok_or_else(|| RunError::internal("generator frame vanished"))?;

        if frame.started && throw.is_none() {
            frame.push(arg);
        } else {
            arg.drop_with_heap(self.heap);
        }

        let result = self.eval_frame(&mut frame, throw);

        let keep = matches!(result, Ok(FrameExit::Yield(_)));
        let finished_frame = match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => {
                generator.running = false;
                if keep {
                    generator.frame = Some(frame);
                    None
                } else {
                    generator.closed = true;
                    Some(frame)
                }
            }
            _ => Some(frame),
        };
        if let Some(frame) = finished_frame {
            (*frame).drop_with_heap(self.heap);
        }

        match result {
            Ok(FrameExit::Yield(value)) => Ok(GenStep::Yielded(value)),
            Ok(FrameExit::Return(value)) if kind == GenKind::AsyncGenerator => {
                value.drop_with_heap(self.heap);
                Err(SimpleException::new_none(ExcType::StopAsyncIteration).into())
            }
            Ok(FrameExit::Return(value)) => Ok(GenStep::Returned(value)),
            Err(err) => Err(self.convert_leaked_stop(kind, err)),
        }
    }

    /// A `StopIteration` escaping a generator body becomes a `RuntimeError`
    /// whose cause is the original exception (PEP 479); likewise
    /// `StopAsyncIteration` escaping an async generator.
    fn convert_leaked_stop(&mut self, kind: GenKind, err: RunError) -> RunError {
        let msg = if err.matches(ExcType::StopIteration, self.heap) {
            format!("{} raised StopIteration", kind.noun())
        } else if kind == GenKind::AsyncGenerator && err.matches(ExcType::StopAsyncIteration, self.heap) {
            "async generator raised StopAsyncIteration".to_owned()
        } else {
            return err;
        };
        let RunError::Exc(mut raise) = err else {
            return err;
        };
        let cause = match raise.normalize(self.heap) {
            Ok(id) => id,
            Err(e) => {
                raise.drop_with_heap(self.heap);
                return e;
            }
        };
        let ExceptionRaise { traceback, .. } = *raise;
        let mut obj = match ExceptionObject::from_simple(SimpleException::new_msg(ExcType::RuntimeError, msg), self.heap)
        {
            Ok(obj) => obj,
            Err(e) => {
                self.heap.dec_ref(cause);
                return e;
            }
        };
        self.heap.inc_ref(cause);
        obj.cause = Value::Ref(cause);
        obj.context = Value::Ref(cause);
        obj.suppress_context = true;
        match self.heap.allocate(HeapData::Exception(obj)) {
            Ok(id) => {
                let mut converted = ExceptionRaise::from_instance(id, traceback);
                converted.chained = true;
                converted.into()
            }
            Err(e) => e.into(),
        }
    }

    /// `throw()` into a generator, forwarding to its delegated sub-iterator first.
    ///
    /// With `close_on_genexit`, a `GeneratorExit` closes the sub-iterator and is
    /// then raised in this generator; `aclose()` passes `false` so the exit
    /// travels through the delegation chain like any other exception.
    pub(crate) fn gen_throw(&mut self, gen_id: HeapId, err: RunError, close_on_genexit: bool) -> RunResult<GenStep> {
        let Some(delegate) = self.delegate_of(gen_id) else {
            return self.gen_send_ex(gen_id, Value::None, Some(err), false);
        };

        if close_on_genexit && err.matches(ExcType::GeneratorExit, self.heap) {
            self.set_running(gen_id, true);
            let closed = self.close_iter(&delegate);
            self.set_running(gen_id, false);
            delegate.drop_with_heap(self.heap);
            return match closed {
                Ok(()) => self.gen_send_ex(gen_id, Value::None, Some(err), false),
                Err(close_err) => {
                    err.drop_with_heap(self.heap);
                    self.gen_send_ex(gen_id, Value::None, Some(close_err), false)
                }
            };
        }

        if !self.supports_throw(&delegate) {
            delegate.drop_with_heap(self.heap);
            return self.gen_send_ex(gen_id, Value::None, Some(err), false);
        }

        self.set_running(gen_id, true);
        let result = self.throw_into(&delegate, err);
        self.set_running(gen_id, false);
        delegate.drop_with_heap(self.heap);

        let outcome = match result {
            Ok(Next::Value(value)) => return Ok(GenStep::Yielded(value)),
            Ok(Next::Done(value)) => Ok(value),
            Err(e) => Err(e),
        };
        // the sub-iterator is finished: drop it and step past YIELD_FROM
        let popped = match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => generator.frame.as_mut().and_then(|frame| {
                frame.ip += 2;
                frame.stack.pop()
            }),
            _ => None,
        };
        popped.drop_with_heap(self.heap);
        match outcome {
            Ok(value) => self.gen_send_ex(gen_id, value, None, false),
            Err(e) => self.gen_send_ex(gen_id, Value::None, Some(e), false),
        }
    }

    /// `close()`: raises `GeneratorExit` at the suspension point.
    pub(crate) fn gen_close(&mut self, gen_id: HeapId) -> RunResult<()> {
        let kind = match self.heap.get(gen_id) {
            HeapData::Generator(generator) => generator.kind,
            _ => return Ok(()),
        };
        let mut exit: RunError = SimpleException::new_none(ExcType::GeneratorExit).into();
        if let Some(delegate) = self.delegate_of(gen_id) {
            self.set_running(gen_id, true);
            let closed = self.close_iter(&delegate);
            self.set_running(gen_id, false);
            delegate.drop_with_heap(self.heap);
            if let Err(e) = closed {
                exit = e;
            }
        }
        match self.gen_send_ex(gen_id, Value::None, Some(exit), true) {
            Ok(GenStep::Yielded(value)) => {
                value.drop_with_heap(self.heap);
                Err(ignored_exit(kind))
            }
            Ok(GenStep::Returned(value)) => {
                value.drop_with_heap(self.heap);
                Ok(())
            }
            Err(e) if e.matches(ExcType::StopIteration, self.heap) || e.matches(ExcType::GeneratorExit, self.heap) => {
                e.drop_with_heap(self.heap);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_running(&mut self, gen_id: HeapId, running: bool) {
        if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
            generator.running = running;
        }
    }

    /// The sub-iterator a suspended generator is delegating to (new reference).
    fn delegate_of(&mut self, gen_id: HeapId) -> Option<Value> {
        let delegate = match self.heap.get(gen_id) {
            HeapData::Generator(generator) => generator
                .frame
                .as_ref()
                .filter(|frame| frame.started && frame.code.opcode_at(frame.ip) == Some(Opcode::YieldFrom))
                .and_then(|frame| frame.stack.last())
                .map(Value::copy_for_extend),
            _ => None,
        }?;
        if let Value::Ref(id) = &delegate {
            self.heap.inc_ref(*id);
        }
        Some(delegate)
    }

    // ========================================================================
    // Iterator-level send/throw/close
    // ========================================================================

    /// Sends `arg` into any sub-iterator `YIELD_FROM` can delegate to.
    pub(crate) fn send_value(&mut self, receiver: &Value, arg: Value) -> RunResult<Next> {
        let Some(id) = receiver.ref_id() else {
            arg.drop_with_heap(self.heap);
            return Err(not_an_iterator(receiver.type_name(self.heap)));
        };
        match self.heap.get(id) {
            HeapData::Iter(it) => {
                if !arg.is_none() {
                    let type_name = it.type_name();
                    arg.drop_with_heap(self.heap);
                    return Err(ExcType::attribute_error(type_name, "send"));
                }
                Ok(crate::types::iter_next(self.heap, id)?.map_or(Next::Done(Value::None), Next::Value))
            }
            HeapData::Generator(generator) if generator.kind != GenKind::AsyncGenerator => {
                self.gen_send_ex(id, arg, None, false).map(Next::from)
            }
            HeapData::CoroutineWrapper(coro) => {
                let coro = *coro;
                self.gen_send_ex(coro, arg, None, false).map(Next::from)
            }
            HeapData::AIterWrapper(wrapper) => {
                let value = wrapper.value.copy_for_extend();
                if let Value::Ref(id) = &value {
                    self.heap.inc_ref(*id);
                }
                arg.drop_with_heap(self.heap);
                Ok(Next::Done(value))
            }
            HeapData::AsyncGenAwaitable(_) => self.awaitable_send(id, arg),
            _ => {
                arg.drop_with_heap(self.heap);
                Err(not_an_iterator(receiver.type_name(self.heap)))
            }
        }
    }

    /// Whether `throw()` can be forwarded into `value`.
    fn supports_throw(&self, value: &Value) -> bool {
        value.ref_id().is_some_and(|id| match self.heap.get(id) {
            HeapData::Generator(generator) => generator.kind != GenKind::AsyncGenerator,
            HeapData::CoroutineWrapper(_) | HeapData::AsyncGenAwaitable(_) => true,
            _ => false,
        })
    }

    fn throw_into(&mut self, receiver: &Value, err: RunError) -> RunResult<Next> {
        let Some(id) = receiver.ref_id() else {
            return Err(err);
        };
        match self.heap.get(id) {
            HeapData::Generator(_) => self.gen_throw(id, err, true).map(Next::from),
            HeapData::CoroutineWrapper(coro) => {
                let coro = *coro;
                self.gen_throw(coro, err, true).map(Next::from)
            }
            HeapData::AsyncGenAwaitable(_) => self.awaitable_throw(id, err),
            _ => Err(err),
        }
    }

    /// Calls `close()` on a sub-iterator if it has one.
    fn close_iter(&mut self, value: &Value) -> RunResult<()> {
        let Some(id) = value.ref_id() else {
            return Ok(());
        };
        match self.heap.get_mut(id) {
            HeapData::Generator(generator) if generator.kind != GenKind::AsyncGenerator => self.gen_close(id),
            HeapData::CoroutineWrapper(coro) => {
                let coro = *coro;
                self.gen_close(coro)
            }
            HeapData::AsyncGenAwaitable(awaitable) => {
                awaitable.state = AwaitableState::Closed;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// `next(iterator)`: `Ok(None)` when exhausted.
    pub(crate) fn iter_next_value(&mut self, iter: &Value) -> RunResult<Option<Value>> {
        match self.send_value(iter, Value::None)? {
            Next::Value(value) => Ok(Some(value)),
            Next::Done(value) => {
                value.drop_with_heap(self.heap);
                Ok(None)
            }
        }
    }

    /// Turns an exhausted [`Next`] into the `StopIteration` a Python-level call raises.
    pub(crate) fn next_to_result(&mut self, next: Next) -> RunResult<Value> {
        match next {
            Next::Value(value) => Ok(value),
            Next::Done(value) => Err(self.stop_iteration(value)),
        }
    }

    /// `StopIteration(value)`, or a bare `StopIteration` for `None`.
    pub(crate) fn stop_iteration(&mut self, value: Value) -> RunError {
        if value.is_none() {
            return SimpleException::new_none(ExcType::StopIteration).into();
        }
        match self
            .heap
            .allocate(HeapData::Exception(ExceptionObject::new(ExcType::StopIteration, vec![value])))
        {
            Ok(id) => ExceptionRaise::from_instance(id, Vec::new()).into(),
            Err(e) => e.into(),
        }
    }

    /// Normalizes the `(type, value, traceback)` arguments of `throw()`/`athrow()`.
    ///
    /// All three are consumed; `Undefined` marks an omitted argument.
    pub(crate) fn make_thrown(&mut self, typ: Value, val: Value, tb: Value) -> RunResult<RunError> {
        let frames = match &tb {
            Value::Undefined | Value::None => Vec::new(),
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Traceback(_)) => self.traceback_frames(&tb),
            _ => {
                [typ, val, tb].drop_with_heap(self.heap);
                return Err(ExcType::type_error("throw() third argument must be a traceback object"));
            }
        };
        tb.drop_with_heap(self.heap);
        let no_value = matches!(val, Value::Undefined | Value::None);
        let exc_id = match typ {
            Value::ExcClass(exc_type) => {
                let instance = match &val {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Exception(obj) if obj.exc_type.is_subclass_of(exc_type) => Some(*id),
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(id) = instance {
                    val.forget();
                    id
                } else {
                    let args = if no_value {
                        val.drop_with_heap(self.heap);
                        Vec::new()
                    } else if let Some(items) = val.ref_id().and_then(|id| match self.heap.get(id) {
                        HeapData::Tuple(items) => Some(items.iter().map(Value::copy_for_extend).collect::<Vec<_>>()),
                        _ => None,
                    }) {
                        self.heap.inc_ref_values(&items);
                        val.drop_with_heap(self.heap);
                        items
                    } else {
                        vec![val]
                    };
                    self.heap
                        .allocate(HeapData::Exception(ExceptionObject::new(exc_type, args)))?
                }
            }
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Exception(_)) => {
                if !no_value {
                    val.drop_with_heap(self.heap);
                    self.heap.dec_ref(id);
                    return Err(ExcType::type_error("instance exception may not have a separate value"));
                }
                id
            }
            other => {
                let type_name = other.type_name(self.heap);
                let msg = format!("exceptions must be classes or instances deriving from BaseException, not {type_name}");
                other.drop_with_heap(self.heap);
                val.drop_with_heap(self.heap);
                return Err(ExcType::type_error(msg));
            }
        };
        Ok(ExceptionRaise::from_instance(exc_id, frames).into())
    }

    // ========================================================================
    // Async generator awaitables
    // ========================================================================

    /// Maps an async generator step onto what its awaitable reports: a wrapped
    /// (async-yielded) value completes the awaitable via `StopIteration(value)`,
    /// anything else passes through to the awaiting coroutine.
    fn unwrap_async_value(&mut self, gen_id: HeapId, step: RunResult<GenStep>) -> RunResult<Next> {
        match step {
            Ok(GenStep::Yielded(value)) => match self.take_wrapped(value) {
                Ok(inner) => Ok(Next::Done(inner)),
                Err(raw) => Ok(Next::Value(raw)),
            },
            Ok(GenStep::Returned(value)) => {
                value.drop_with_heap(self.heap);
                self.mark_async_gen_closed(gen_id);
                Err(SimpleException::new_none(ExcType::StopAsyncIteration).into())
            }
            Err(e) => {
                if e.matches(ExcType::StopAsyncIteration, self.heap) || e.matches(ExcType::GeneratorExit, self.heap) {
                    self.mark_async_gen_closed(gen_id);
                }
                Err(e)
            }
        }
    }

    /// Unwraps an `AsyncGenWrapped` value, consuming the wrapper; any other
    /// value is handed back in `Err`.
    fn take_wrapped(&mut self, value: Value) -> Result<Value, Value> {
        let inner = match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::AsyncGenWrapped(inner)) => inner.copy_for_extend(),
            _ => return Err(value),
        };
        if let Value::Ref(id) = &inner {
            self.heap.inc_ref(*id);
        }
        value.drop_with_heap(self.heap);
        Ok(inner)
    }

    fn mark_async_gen_closed(&mut self, gen_id: HeapId) {
        if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
            generator.closed = true;
        }
    }

    fn set_awaitable_state(&mut self, awaitable_id: HeapId, state: AwaitableState) {
        if let HeapData::AsyncGenAwaitable(awaitable) = self.heap.get_mut(awaitable_id) {
            awaitable.state = state;
        }
    }

    fn awaitable_info(&self, awaitable_id: HeapId) -> RunResult<(HeapId, AwaitableMode, AwaitableState)> {
        match self.heap.get(awaitable_id) {
            HeapData::AsyncGenAwaitable(a) => Ok((a.gen_id, a.mode, a.state)),
            _ => Err(RunError::internal("expected an async generator awaitable")),
        }
    }

    /// `send()` on an `asend`/`athrow`/`aclose` awaitable.
    fn awaitable_send(&mut self, awaitable_id: HeapId, arg: Value) -> RunResult<Next> {
        let (gen_id, mode, state) = self.awaitable_info(awaitable_id)?;
        if state == AwaitableState::Closed {
            arg.drop_with_heap(self.heap);
            return Ok(Next::Done(Value::None));
        }
        match mode {
            AwaitableMode::Send => {
                let arg = if state == AwaitableState::Init {
                    let initial = match self.heap.get_mut(awaitable_id) {
                        HeapData::AsyncGenAwaitable(a) => {
                            a.state = AwaitableState::Iter;
                            std::mem::replace(&mut a.send_value, Value::None)
                        }
                        _ => Value::None,
                    };
                    if arg.is_none() {
                        initial
                    } else {
                        initial.drop_with_heap(self.heap);
                        arg
                    }
                } else {
                    arg
                };
                let step = self.gen_send_ex(gen_id, arg, None, false);
                let next = self.unwrap_async_value(gen_id, step);
                if !matches!(next, Ok(Next::Value(_))) {
                    self.set_awaitable_state(awaitable_id, AwaitableState::Closed);
                }
                next
            }
            AwaitableMode::Throw | AwaitableMode::Close => self.athrow_send(awaitable_id, gen_id, mode, state, arg),
        }
    }

    fn athrow_send(
        &mut self,
        awaitable_id: HeapId,
        gen_id: HeapId,
        mode: AwaitableMode,
        state: AwaitableState,
        arg: Value,
    ) -> RunResult<Next> {
        let (finished, gen_closed) = match self.heap.get(gen_id) {
            HeapData::Generator(g) => (g.is_finished(), g.closed),
            _ => (true, true),
        };
        if finished {
            arg.drop_with_heap(self.heap);
            return Ok(Next::Done(Value::None));
        }

        if state == AwaitableState::Init {
            if gen_closed {
                arg.drop_with_heap(self.heap);
                return Ok(Next::Done(Value::None));
            }
            if !arg.is_none() {
                arg.drop_with_heap(self.heap);
                return Err(ExcType::runtime_error("can't send non-None value to a just-started coroutine"));
            }
            let args = match self.heap.get_mut(awaitable_id) {
                HeapData::AsyncGenAwaitable(a) => {
                    a.state = AwaitableState::Iter;
                    std::mem::replace(&mut a.throw_args, [Value::Undefined, Value::Undefined, Value::Undefined])
                }
                _ => [Value::Undefined, Value::Undefined, Value::Undefined],
            };
            let result = if mode == AwaitableMode::Close {
                args.drop_with_heap(self.heap);
                self.mark_async_gen_closed(gen_id);
                let exit = SimpleException::new_none(ExcType::GeneratorExit).into();
                match self.gen_throw(gen_id, exit, false) {
                    Ok(GenStep::Yielded(value)) => self.aclose_yielded(value),
                    Ok(GenStep::Returned(value)) => Ok(Next::Done(value)),
                    Err(e) => Err(e),
                }
            } else {
                let [typ, val, tb] = args;
                let step = match self.make_thrown(typ, val, tb) {
                    Ok(err) => self.gen_throw(gen_id, err, false),
                    Err(e) => Err(e),
                };
                self.unwrap_async_value(gen_id, step)
            };
            return match result {
                Err(e) => self.athrow_check_error(awaitable_id, mode, e),
                ok => ok,
            };
        }

        let step = self.gen_send_ex(gen_id, arg, None, false);
        if mode == AwaitableMode::Throw {
            return self.unwrap_async_value(gen_id, step);
        }
        match step {
            Ok(GenStep::Yielded(value)) => self.aclose_yielded(value),
            Ok(GenStep::Returned(value)) => Ok(Next::Done(value)),
            Err(e) => self.athrow_check_error(awaitable_id, mode, e),
        }
    }

    /// During `aclose()` an async yield means the generator ignored the exit;
    /// a raw value is an `await` inside a `finally` and passes through.
    fn aclose_yielded(&mut self, value: Value) -> RunResult<Next> {
        match self.take_wrapped(value) {
            Ok(inner) => {
                inner.drop_with_heap(self.heap);
                Err(ignored_exit(GenKind::AsyncGenerator))
            }
            Err(raw) => Ok(Next::Value(raw)),
        }
    }

    /// Generator exhaustion closes the awaitable; for `aclose()` it is the
    /// expected outcome and completes the await normally.
    fn athrow_check_error(&mut self, awaitable_id: HeapId, mode: AwaitableMode, err: RunError) -> RunResult<Next> {
        if err.matches(ExcType::StopAsyncIteration, self.heap) || err.matches(ExcType::GeneratorExit, self.heap) {
            self.set_awaitable_state(awaitable_id, AwaitableState::Closed);
            if mode == AwaitableMode::Close {
                err.drop_with_heap(self.heap);
                return Ok(Next::Done(Value::None));
            }
        }
        Err(err)
    }

    /// `throw()` on an `asend`/`athrow`/`aclose` awaitable.
    fn awaitable_throw(&mut self, awaitable_id: HeapId, err: RunError) -> RunResult<Next> {
        let (gen_id, mode, state) = self.awaitable_info(awaitable_id)?;
        if state == AwaitableState::Closed {
            err.drop_with_heap(self.heap);
            return Ok(Next::Done(Value::None));
        }
        let step = self.gen_throw(gen_id, err, true);
        match mode {
            AwaitableMode::Send => {
                let next = self.unwrap_async_value(gen_id, step);
                if !matches!(next, Ok(Next::Value(_))) {
                    self.set_awaitable_state(awaitable_id, AwaitableState::Closed);
                }
                next
            }
            AwaitableMode::Throw => self.unwrap_async_value(gen_id, step),
            AwaitableMode::Close => match step {
                Ok(GenStep::Yielded(value)) => self.aclose_yielded(value),
                Ok(GenStep::Returned(value)) => Ok(Next::Done(value)),
                Err(e) => Err(e),
            },
        }
    }

    // ========================================================================
    // Opcodes
    // ========================================================================

    /// `YIELD_VALUE`. Async generators wrap the value so their awaitables can
    /// tell an async yield from an `await` passing through.
    pub(super) fn yield_value(&mut self, frame: &mut Frame) -> Why {
        let value = frame.pop();
        if !frame.code.flags.contains(CodeFlags::ASYNC_GENERATOR) {
            return Why::Yield(value);
        }
        match self.heap.allocate(HeapData::AsyncGenWrapped(value)) {
            Ok(id) => Why::Yield(Value::Ref(id)),
            Err(e) => Why::Exception(e.into()),
        }
    }

    /// `YIELD_FROM`: sends TOS into the sub-iterator at TOS1.
    ///
    /// While the sub-iterator produces values the frame suspends with the
    /// instruction pointer rewound onto this instruction, so the next resume
    /// sends again. On exhaustion the sub-iterator is replaced by its result.
    pub(super) fn yield_from(&mut self, frame: &mut Frame) -> Result<(), Why> {
        let arg = frame.pop();
        match self.send_value(frame.top(), arg)? {
            Next::Value(value) => {
                frame.ip = frame.lasti;
                Err(Why::Yield(value))
            }
            Next::Done(result) => {
                frame.pop().drop_with_heap(self.heap);
                frame.push(result);
                Ok(())
            }
        }
    }

    /// `GET_YIELD_FROM_ITER`.
    pub(super) fn get_yield_from_iter(&mut self, frame: &mut Frame) -> RunResult<()> {
        let kind = match frame.top().ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Generator(generator)) => Some(generator.kind),
            _ => None,
        };
        match kind {
            Some(GenKind::Coroutine)
                if !frame.code.flags.contains(CodeFlags::COROUTINE)
                    && !frame.code.flags.contains(CodeFlags::ITERABLE_COROUTINE) =>
            {
                frame.pop().drop_with_heap(self.heap);
                Err(ExcType::type_error(
                    "cannot 'yield from' a coroutine object in a non-coroutine generator",
                ))
            }
            Some(GenKind::Coroutine | GenKind::Generator) => Ok(()),
            _ => {
                let iterable = frame.pop();
                let iter = self.get_iter(&iterable);
                iterable.drop_with_heap(self.heap);
                frame.push(iter?);
                Ok(())
            }
        }
    }

    /// The iterator `await value` drives (new reference). `value` is borrowed.
    fn awaitable_iter(&mut self, value: &Value) -> RunResult<Value> {
        let awaitable = value.ref_id().is_some_and(|id| match self.heap.get(id) {
            HeapData::Generator(generator) => match generator.kind {
                GenKind::Coroutine => true,
                GenKind::Generator => generator
                    .frame
                    .as_ref()
                    .is_some_and(|f| f.code.flags.contains(CodeFlags::ITERABLE_COROUTINE)),
                GenKind::AsyncGenerator => false,
            },
            HeapData::AsyncGenAwaitable(_) | HeapData::AIterWrapper(_) => true,
            _ => false,
        });
        if awaitable {
            Ok(value.clone_with_heap(self.heap))
        } else {
            Err(ExcType::type_error(format!(
                "object {} can't be used in 'await' expression",
                value.type_name(self.heap)
            )))
        }
    }

    /// `GET_AWAITABLE`.
    pub(super) fn get_awaitable(&mut self, frame: &mut Frame) -> RunResult<()> {
        let value = frame.pop();
        let iter = self.awaitable_iter(&value);
        value.drop_with_heap(self.heap);
        let iter = iter?;
        let is_coroutine = matches!(
            iter.ref_id().map(|id| self.heap.get(id)),
            Some(HeapData::Generator(g)) if g.kind == GenKind::Coroutine
        );
        if is_coroutine
            && let Some(id) = iter.ref_id()
            && let Some(delegate) = self.delegate_of(id)
        {
            delegate.drop_with_heap(self.heap);
            iter.drop_with_heap(self.heap);
            return Err(ExcType::runtime_error("coroutine is being awaited already"));
        }
        frame.push(iter);
        Ok(())
    }

    /// `GET_AITER`: `__aiter__` must return an asynchronous iterator, which is
    /// wrapped in an awaitable resolving to it.
    pub(super) fn get_aiter(&mut self, frame: &mut Frame) -> RunResult<()> {
        let obj = frame.pop();
        let is_async_gen = matches!(
            obj.ref_id().map(|id| self.heap.get(id)),
            Some(HeapData::Generator(g)) if g.kind == GenKind::AsyncGenerator
        );
        if !is_async_gen {
            let msg = format!(
                "'async for' requires an object with __aiter__ method, got {}",
                obj.type_name(self.heap)
            );
            obj.drop_with_heap(self.heap);
            return Err(ExcType::type_error(msg));
        }
        let wrapper = self.alloc(HeapData::AIterWrapper(AIterWrapper { value: obj }))?;
        frame.push(wrapper);
        Ok(())
    }

    /// `GET_ANEXT`: leaves the iterator in place and pushes the awaitable for its next item.
    pub(super) fn get_anext(&mut self, frame: &mut Frame) -> RunResult<()> {
        let gen_id = match frame.top().ref_id() {
            Some(id) if matches!(self.heap.get(id), HeapData::Generator(g) if g.kind == GenKind::AsyncGenerator) => id,
            _ => {
                return Err(ExcType::type_error(format!(
                    "'async for' requires an iterator with __anext__ method, got {}",
                    frame.top().type_name(self.heap)
                )));
            }
        };
        let awaitable = self.async_gen_awaitable(gen_id, AwaitableMode::Send, Value::None, Default::default())?;
        frame.push(awaitable);
        Ok(())
    }

    /// Allocates an `asend`/`athrow`/`aclose` awaitable for `gen_id` (borrowed).
    fn async_gen_awaitable(
        &mut self,
        gen_id: HeapId,
        mode: AwaitableMode,
        send_value: Value,
        throw_args: [Value; 3],
    ) -> RunResult<Value> {
        self.heap.inc_ref(gen_id);
        self.alloc(HeapData::AsyncGenAwaitable(AsyncGenAwaitable::new(
            gen_id, mode, send_value, throw_args,
        )))
    }

    // ========================================================================
    // Python-level methods
    // ========================================================================

    /// Calls a generator, coroutine or async-generator method on `receiver` (borrowed).
    pub(crate) fn call_generator_method(
        &mut self,
        method: MethodKind,
        receiver: &Value,
        args: Vec<Value>,
    ) -> RunResult<Value> {
        let name: &'static str = method.into();
        match method {
            MethodKind::GenSend => {
                let [arg] = exact_args(self, name, args)?;
                let next = self.send_value(receiver, arg)?;
                self.next_to_result(next)
            }
            MethodKind::GenNext => {
                let [] = exact_args(self, name, args)?;
                let next = self.send_value(receiver, Value::None)?;
                self.next_to_result(next)
            }
            MethodKind::GenThrow | MethodKind::AsyncGenAthrow => {
                let [typ, val, tb] = throw_args(self, name, args)?;
                if method == MethodKind::AsyncGenAthrow {
                    let gen_id = receiver_id(receiver)?;
                    return self.async_gen_awaitable(gen_id, AwaitableMode::Throw, Value::None, [typ, val, tb]);
                }
                let err = self.make_thrown(typ, val, tb)?;
                if !self.supports_throw(receiver) {
                    return Err(err);
                }
                let next = self.throw_into(receiver, err)?;
                self.next_to_result(next)
            }
            MethodKind::GenClose => {
                let [] = exact_args(self, name, args)?;
                self.close_iter(receiver)?;
                Ok(Value::None)
            }
            MethodKind::CoroAwait => {
                let [] = exact_args(self, name, args)?;
                let id = receiver_id(receiver)?;
                if matches!(self.heap.get(id), HeapData::Generator(_)) {
                    self.heap.inc_ref(id);
                    self.alloc(HeapData::CoroutineWrapper(id))
                } else {
                    Ok(receiver.clone_with_heap(self.heap))
                }
            }
            MethodKind::AsyncGenAsend => {
                let [arg] = exact_args(self, name, args)?;
                let gen_id = receiver_id(receiver)?;
                self.async_gen_awaitable(gen_id, AwaitableMode::Send, arg, Default::default())
            }
            MethodKind::AsyncGenAnext => {
                let [] = exact_args(self, name, args)?;
                let gen_id = receiver_id(receiver)?;
                self.async_gen_awaitable(gen_id, AwaitableMode::Send, Value::None, Default::default())
            }
            MethodKind::AsyncGenAclose => {
                let [] = exact_args(self, name, args)?;
                let gen_id = receiver_id(receiver)?;
                self.async_gen_awaitable(gen_id, AwaitableMode::Close, Value::None, Default::default())
            }
            MethodKind::AsyncGenAiter => {
                let [] = exact_args(self, name, args)?;
                Ok(receiver.clone_with_heap(self.heap))
            }
            _ => {
                args.drop_with_heap(self.heap);
                Err(RunError::internal("not a generator method"))
            }
        }
    }
}

fn receiver_id(receiver: &Value) -> RunResult<HeapId> {
    receiver
        .ref_id()
        .ok_or_else(|| RunError::internal("generator method on an immediate value"))
}

/// Checks a native method received exactly `N` positional arguments.
pub(super) fn exact_args<const N: usize, T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut VM<'_, T, P, Tr>,
    name: &str,
    args: Vec<Value>,
) -> RunResult<[Value; N]> {
    let given = args.len();
    args.try_into().map_err(|args: Vec<Value>| {
        args.drop_with_heap(vm.heap);
        match N {
            0 => ExcType::type_error(format!("{name}() takes no arguments ({given} given)")),
            1 => ExcType::type_error(format!("{name}() takes exactly one argument ({given} given)")),
            _ => ExcType::type_error(format!("{name}() takes exactly {N} arguments ({given} given)")),
        }
    })
}

/// `throw(typ[, val[, tb]])`, padding omitted arguments with `Undefined`.
fn throw_args<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut VM<'_, T, P, Tr>,
    name: &str,
    args: Vec<Value>,
) -> RunResult<[Value; 3]> {
    match args.len() {
        0 => Err(ExcType::type_error(format!("{name} expected at least 1 arguments, got 0"))),
        1..=3 => {
            let mut it = args.into_iter();
            Ok([
                it.next().unwrap_or_default(),
                it.next().unwrap_or_default(),
                it.next().unwrap_or_default(),
            ])
        }
        n => {
            args.drop_with_heap(vm.heap);
            Err(ExcType::type_error(format!("{name} expected at most 3 arguments, got {n}")))
        }
    }
}
