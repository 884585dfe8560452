//! Calls: the `CALL_FUNCTION*` opcodes, `MAKE_FUNCTION`, argument binding and
//! frame creation for Python functions.

use std::rc::Rc;

use crate::{
    bytecode::{Code, CodeFlags, make_function_flags},
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{
        BoundMethod, BuiltinMethod, ContextManager, Dict, ExceptionObject, Function, GenKind, Generator, HashKey,
        MethodKind, dict_get_item, dict_set_item,
    },
    value::Value,
};

use super::{Frame, FrameExit, VM};

/// Arguments of one call: positional values plus `(name, value)` keyword pairs.
///
/// Every value is owned; keyword names are normally `str` but are only checked
/// when they are bound.
#[derive(Debug, Default)]
pub(crate) struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Vec<(Value, Value)>,
}

impl CallArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Vec::new(),
        }
    }

    /// Fails with "X() takes no keyword arguments" if any keyword was passed.
    pub fn no_kwargs(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Vec<Value>> {
        if self.kwargs.is_empty() {
            return Ok(self.args);
        }
        self.drop_with_heap(heap);
        Err(ExcType::type_error(format!("{name}() takes no keyword arguments")))
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for CallArgs {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.args.drop_with_heap(heap);
        for (name, value) in self.kwargs {
            name.drop_with_heap(heap);
            value.drop_with_heap(heap);
        }
    }
}

/// Snapshot of the function fields needed to build a frame.
struct Callee {
    code: Rc<Code>,
    code_id: HeapId,
    globals: HeapId,
    defaults: Option<HeapId>,
    kwdefaults: Option<HeapId>,
    closure: Option<HeapId>,
    name: String,
    qualname: String,
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    // ========================================================================
    // Opcodes
    // ========================================================================

    /// `CALL_FUNCTION argc`: positional arguments only.
    pub(super) fn call_function_op(&mut self, frame: &mut Frame, argc: usize) -> RunResult<()> {
        let args = frame.pop_n(argc);
        let func = frame.pop();
        let result = self.call_value(&func, CallArgs::positional(args));
        func.drop_with_heap(self.heap);
        frame.push(result?);
        Ok(())
    }

    /// `CALL_FUNCTION_KW argc`: TOS is a tuple naming the trailing keyword arguments.
    pub(super) fn call_function_kw_op(&mut self, frame: &mut Frame, argc: usize) -> RunResult<()> {
        let names = frame.pop();
        let mut args = frame.pop_n(argc);
        let func = frame.pop();
        let keys = names.ref_id().and_then(|id| self.heap.sequence_items(id));
        names.drop_with_heap(self.heap);
        let Some(keys) = keys.filter(|keys| keys.len() <= args.len()) else {
            args.drop_with_heap(self.heap);
            func.drop_with_heap(self.heap);
            return Err(ExcType::system_error("bad CALL_FUNCTION_KW names tuple"));
        };
        let values = args.split_off(args.len() - keys.len());
        let call = CallArgs {
            args,
            kwargs: keys.into_iter().zip(values).collect(),
        };
        let result = self.call_value(&func, call);
        func.drop_with_heap(self.heap);
        frame.push(result?);
        Ok(())
    }

    /// `CALL_FUNCTION_EX flags`: `f(*args)` and `f(*args, **kwargs)`.
    pub(super) fn call_function_ex_op(&mut self, frame: &mut Frame, flags: usize) -> RunResult<()> {
        let kwargs = if flags & 1 == 1 { Some(frame.pop()) } else { None };
        let callargs = frame.pop();
        let func = frame.pop();
        let result = self.call_ex(&func, callargs, kwargs);
        func.drop_with_heap(self.heap);
        frame.push(result?);
        Ok(())
    }

    fn call_ex(&mut self, func: &Value, callargs: Value, kwargs: Option<Value>) -> RunResult<Value> {
        let kwargs = match kwargs {
            Some(mapping) => {
                let pairs = match mapping.ref_id().map(|id| self.heap.get(id)) {
                    Some(HeapData::Dict(d)) => Some(
                        d.iter()
                            .map(|(k, v)| (k.copy_for_extend(), v.copy_for_extend()))
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                };
                let Some(pairs) = pairs else {
                    let msg = format!(
                        "{} argument after ** must be a mapping, not {}",
                        self.func_label(func),
                        mapping.type_name(self.heap)
                    );
                    mapping.drop_with_heap(self.heap);
                    callargs.drop_with_heap(self.heap);
                    return Err(ExcType::type_error(msg));
                };
                for (k, v) in &pairs {
                    for value in [k, v] {
                        if let Value::Ref(id) = value {
                            self.heap.inc_ref(*id);
                        }
                    }
                }
                mapping.drop_with_heap(self.heap);
                pairs
            }
            None => Vec::new(),
        };
        let args = match callargs.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Tuple(_)) => {
                let items = callargs.ref_id().and_then(|id| self.heap.sequence_items(id)).unwrap_or_default();
                callargs.drop_with_heap(self.heap);
                items
            }
            _ => {
                let label = self.func_label(func);
                let type_name = callargs.type_name(self.heap);
                match self.collect_iterable(callargs) {
                    Ok(items) => items,
                    Err(e) => {
                        kwargs.drop_with_heap(self.heap);
                        if e.matches(ExcType::TypeError, self.heap) {
                            e.drop_with_heap(self.heap);
                            return Err(ExcType::type_error(format!(
                                "{label} argument after * must be an iterable, not {type_name}"
                            )));
                        }
                        return Err(e);
                    }
                }
            }
        };
        self.call_value(func, CallArgs { args, kwargs })
    }

    /// `MAKE_FUNCTION flags`: pops the qualified name, the code object and then
    /// the optional closure, annotations, keyword defaults and defaults.
    pub(super) fn make_function(&mut self, frame: &mut Frame, flags: u32) -> RunResult<()> {
        let qualname = frame.pop();
        let code = frame.pop();
        let mut optional = |flag: u32| {
            if flags & flag == 0 {
                return None;
            }
            let value = frame.pop();
            let id = value.ref_id();
            value.forget();
            id
        };
        let closure = optional(make_function_flags::CLOSURE);
        let annotations = optional(make_function_flags::ANNOTATIONS);
        let kwdefaults = optional(make_function_flags::KWDEFAULTS);
        let defaults = optional(make_function_flags::DEFAULTS);

        let qualname_str = qualname.as_str(self.heap).map(str::to_owned);
        let (code_id, name) = match code.ref_id().map(|id| (id, self.heap.get(id))) {
            Some((id, HeapData::Code(c))) => (Some(id), c.code.name.clone()),
            _ => (None, String::new()),
        };
        qualname.drop_with_heap(self.heap);
        let (Some(code_id), Some(qualname)) = (code_id, qualname_str) else {
            code.drop_with_heap(self.heap);
            [closure, annotations, kwdefaults, defaults].drop_with_heap(self.heap);
            return Err(ExcType::system_error("MAKE_FUNCTION expects a code object and a qualified name"));
        };
        code.forget();
        self.heap.inc_ref(frame.globals);
        let func = self.alloc(HeapData::Function(Function {
            code: code_id,
            globals: frame.globals,
            name,
            qualname,
            defaults,
            kwdefaults,
            closure,
            annotations,
            dict: None,
        }))?;
        frame.push(func);
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Calls `callable` (borrowed) with `args` (consumed), returning a new reference.
    pub(crate) fn call_value(&mut self, callable: &Value, args: CallArgs) -> RunResult<Value> {
        match callable {
            Value::Builtin(builtin) => self.call_builtin(*builtin, args),
            Value::ExcClass(exc_type) => {
                let exc_type = *exc_type;
                let name: &'static str = exc_type.into();
                let args = args.no_kwargs(name, self.heap)?;
                self.alloc(HeapData::Exception(ExceptionObject::new(exc_type, args)))
            }
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Function(_) => self.call_function(*id, args),
                HeapData::BoundMethod(method) => {
                    let func = method.func.copy_for_extend();
                    let receiver = method.receiver.copy_for_extend();
                    for id in [func.ref_id(), receiver.ref_id()].into_iter().flatten() {
                        self.heap.inc_ref(id);
                    }
                    let mut args = args;
                    args.args.insert(0, receiver);
                    let result = self.call_value(&func, args);
                    func.drop_with_heap(self.heap);
                    result
                }
                HeapData::BuiltinMethod(method) => {
                    let kind = method.method;
                    let receiver = method.receiver.copy_for_extend();
                    if let Some(id) = receiver.ref_id() {
                        self.heap.inc_ref(id);
                    }
                    let result = self.call_method(kind, &receiver, args);
                    receiver.drop_with_heap(self.heap);
                    result
                }
                _ => {
                    args.drop_with_heap(self.heap);
                    Err(ExcType::type_error_not_callable(callable.type_name(self.heap)))
                }
            },
            _ => {
                args.drop_with_heap(self.heap);
                Err(ExcType::type_error_not_callable(callable.type_name(self.heap)))
            }
        }
    }

    /// Name of a callable as it appears in call-site error messages:
    /// `f()`, `int constructor` or `int object`.
    pub(crate) fn func_label(&self, func: &Value) -> String {
        match func {
            Value::Builtin(builtin) => {
                let name: &'static str = (*builtin).into();
                if builtin.is_type() {
                    format!("{name} constructor")
                } else {
                    format!("{name}()")
                }
            }
            Value::ExcClass(exc_type) => format!("{exc_type} constructor"),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Function(f) => format!("{}()", f.name),
                HeapData::BoundMethod(m) => match m.func.ref_id().map(|fid| self.heap.get(fid)) {
                    Some(HeapData::Function(f)) => format!("{}()", f.name),
                    _ => format!("{} object", m.func.type_name(self.heap)),
                },
                HeapData::BuiltinMethod(m) => format!("{}()", m.method),
                _ => format!("{} object", func.type_name(self.heap)),
            },
            _ => format!("{} object", func.type_name(self.heap)),
        }
    }

    /// Whether `callable()` reports true for `value`.
    pub(crate) fn is_callable(&self, value: &Value) -> bool {
        match value {
            Value::Builtin(_) | Value::ExcClass(_) => true,
            Value::Ref(id) => matches!(
                self.heap.get(*id),
                HeapData::Function(_) | HeapData::BoundMethod(_) | HeapData::BuiltinMethod(_)
            ),
            _ => false,
        }
    }

    // ========================================================================
    // Python functions
    // ========================================================================

    /// Calls the function at `func_id` (borrowed).
    fn call_function(&mut self, func_id: HeapId, args: CallArgs) -> RunResult<Value> {
        let callee = match self.callee(func_id) {
            Ok(callee) => callee,
            Err(e) => {
                args.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        self.eval_code(callee, args)
    }

    fn callee(&mut self, func_id: HeapId) -> RunResult<Callee> {
        let HeapData::Function(func) = self.heap.get(func_id) else {
            return Err(RunError::internal("call_function on a non-function"));
        };
        let (code_id, globals, defaults, kwdefaults, closure) =
            (func.code, func.globals, func.defaults, func.kwdefaults, func.closure);
        let (name, qualname) = (func.name.clone(), func.qualname.clone());
        let HeapData::Code(code) = self.heap.get(code_id) else {
            return Err(RunError::internal("function without a code object"));
        };
        Ok(Callee {
            code: Rc::clone(&code.code),
            code_id,
            globals,
            defaults,
            kwdefaults,
            closure,
            name,
            qualname,
        })
    }

    /// Builds a frame for `callee`, binds `args` and either runs it or wraps it
    /// in a generator, coroutine or async generator.
    fn eval_code(&mut self, callee: Callee, args: CallArgs) -> RunResult<Value> {
        let flags = callee.code.flags;
        let locals_dict = if flags.contains(CodeFlags::NEWLOCALS) {
            if flags.contains(CodeFlags::OPTIMIZED) {
                None
            } else {
                match self.heap.allocate(HeapData::Dict(Dict::new())) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        args.drop_with_heap(self.heap);
                        return Err(e.into());
                    }
                }
            }
        } else {
            self.heap.inc_ref(callee.globals);
            Some(callee.globals)
        };
        self.heap.inc_ref(callee.code_id);
        self.heap.inc_ref(callee.globals);
        self.heap.inc_ref(self.builtins);
        let mut frame = Frame::new(
            Rc::clone(&callee.code),
            callee.code_id,
            callee.globals,
            self.builtins,
            locals_dict,
        );

        let bound = if is_simple_call(&callee, &args) {
            for (slot, value) in frame.locals.iter_mut().zip(args.args) {
                *slot = value;
            }
            Ok(())
        } else {
            self.bind_arguments(&mut frame, &callee, args)
        };
        if let Err(e) = bound.and_then(|()| self.init_cells(&mut frame, callee.closure)) {
            frame.drop_with_heap(self.heap);
            return Err(e);
        }

        let kind = if flags.contains(CodeFlags::COROUTINE) {
            Some(GenKind::Coroutine)
        } else if flags.contains(CodeFlags::ASYNC_GENERATOR) {
            Some(GenKind::AsyncGenerator)
        } else if flags.contains(CodeFlags::GENERATOR) {
            Some(GenKind::Generator)
        } else {
            None
        };
        if let Some(kind) = kind {
            let generator = Generator::new(kind, frame, callee.name, callee.qualname);
            return self.alloc(HeapData::Generator(generator));
        }

        let result = self.eval_frame(&mut frame, None);
        frame.drop_with_heap(self.heap);
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(value) => {
                value.drop_with_heap(self.heap);
                Err(RunError::internal("non-generator frame yielded"))
            }
        }
    }

    /// Binds positional and keyword arguments to the fast locals of `frame`,
    /// filling defaults and collecting `*args`/`**kwargs`.
    fn bind_arguments(&mut self, frame: &mut Frame, callee: &Callee, call: CallArgs) -> RunResult<()> {
        let code = &callee.code;
        let fname = code.name.as_str();
        let argcount = code.argcount as usize;
        let named = code.named_args();
        let has_varargs = code.flags.contains(CodeFlags::VARARGS);
        let CallArgs { args, kwargs } = call;
        let given = args.len();

        let kwdict = if code.flags.contains(CodeFlags::VARKEYWORDS) {
            let id = match self.heap.allocate(HeapData::Dict(Dict::new())) {
                Ok(id) => id,
                Err(e) => {
                    CallArgs { args, kwargs }.drop_with_heap(self.heap);
                    return Err(e.into());
                }
            };
            let slot = named + usize::from(has_varargs);
            frame.locals[slot] = Value::Ref(id);
            Some(id)
        } else {
            None
        };

        let mut args = args.into_iter();
        for slot in frame.locals.iter_mut().take(argcount.min(given)) {
            if let Some(value) = args.next() {
                *slot = value;
            }
        }
        let extra: Vec<Value> = args.collect();
        if has_varargs {
            frame.locals[named] = self.heap.alloc_tuple(extra)?;
        } else {
            extra.drop_with_heap(self.heap);
        }

        let mut kwargs = kwargs.into_iter();
        while let Some((key, value)) = kwargs.next() {
            let failure = match key.as_str(self.heap) {
                None => Some(ExcType::type_error_keywords_must_be_strings(fname)),
                Some(name) => match code.varnames[..named].iter().position(|v| v == name) {
                    Some(index) if !frame.locals[index].is_undefined() => {
                        Some(ExcType::type_error_multiple_values(fname, name))
                    }
                    Some(index) => {
                        key.drop_with_heap(self.heap);
                        frame.locals[index] = value;
                        continue;
                    }
                    None => match kwdict {
                        Some(dict) => {
                            dict_set_item(self.heap, dict, key, value)?;
                            continue;
                        }
                        None => Some(ExcType::type_error_unexpected_keyword(fname, name)),
                    },
                },
            };
            if let Some(err) = failure {
                key.drop_with_heap(self.heap);
                value.drop_with_heap(self.heap);
                for (k, v) in kwargs {
                    k.drop_with_heap(self.heap);
                    v.drop_with_heap(self.heap);
                }
                return Err(err);
            }
        }

        let defaults = callee
            .defaults
            .and_then(|id| self.heap.sequence_items(id))
            .unwrap_or_default();
        let defcount = defaults.len();
        if given > argcount && !has_varargs {
            defaults.drop_with_heap(self.heap);
            let kwonly_given = frame.locals[argcount..named]
                .iter()
                .filter(|v| !v.is_undefined())
                .count();
            return Err(ExcType::type_error_too_many_positional(
                fname,
                argcount,
                defcount,
                given,
                kwonly_given,
            ));
        }
        if given < argcount {
            let required = argcount.saturating_sub(defcount);
            let missing: Vec<&str> = (given..required)
                .filter(|&i| frame.locals[i].is_undefined())
                .map(|i| code.varnames[i].as_str())
                .collect();
            if !missing.is_empty() {
                defaults.drop_with_heap(self.heap);
                return Err(ExcType::type_error_missing_arguments(fname, "positional", &missing));
            }
        }
        let first_default = argcount.saturating_sub(defcount);
        for (i, default) in defaults.into_iter().enumerate() {
            let slot = &mut frame.locals[first_default + i];
            if slot.is_undefined() {
                *slot = default;
            } else {
                default.drop_with_heap(self.heap);
            }
        }

        if code.kwonlyargcount > 0 {
            let mut missing = Vec::new();
            for i in argcount..named {
                if !frame.locals[i].is_undefined() {
                    continue;
                }
                let name = code.varnames[i].as_str();
                let default = callee
                    .kwdefaults
                    .and_then(|dict| dict_get_item(self.heap, dict, &HashKey::str(name)));
                match default {
                    Some(value) => frame.locals[i] = value,
                    None => missing.push(name),
                }
            }
            if !missing.is_empty() {
                return Err(ExcType::type_error_missing_arguments(fname, "keyword-only", &missing));
            }
        }
        Ok(())
    }

    /// Creates the frame's cells: cell variables get fresh cells (capturing the
    /// argument they shadow, if any) and free variables share the closure's cells.
    pub(crate) fn init_cells(&mut self, frame: &mut Frame, closure: Option<HeapId>) -> RunResult<()> {
        let code = Rc::clone(&frame.code);
        for i in 0..code.cellvars.len() {
            let initial = match code.cell2arg.get(i).copied().flatten() {
                Some(arg) => std::mem::take(&mut frame.locals[arg as usize]),
                None => Value::Undefined,
            };
            let cell = self.heap.alloc_cell(initial)?;
            frame.cells.push(cell);
        }
        if code.freevars.is_empty() {
            return Ok(());
        }
        let cells = closure.and_then(|id| self.heap.sequence_items(id)).unwrap_or_default();
        if cells.len() != code.freevars.len() {
            cells.drop_with_heap(self.heap);
            return Err(ExcType::system_error("closure does not match the code's free variables"));
        }
        for cell in cells {
            match cell {
                Value::Ref(id) if matches!(self.heap.get(id), HeapData::Cell(_)) => {
                    cell.forget();
                    frame.cells.push(id);
                }
                other => {
                    other.drop_with_heap(self.heap);
                    return Err(ExcType::system_error("closure item is not a cell"));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Native methods
    // ========================================================================

    /// Calls a native method on `receiver` (borrowed).
    pub(crate) fn call_method(&mut self, method: MethodKind, receiver: &Value, call: CallArgs) -> RunResult<Value> {
        let name: &'static str = method.into();
        match method {
            MethodKind::GeneratorCmFactory => {
                let generator = self.call_value(receiver, call)?;
                let Some(gen_id) = generator.ref_id().filter(|id| matches!(self.heap.get(*id), HeapData::Generator(_))) else {
                    generator.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("contextmanager function did not return a generator"));
                };
                generator.forget();
                self.alloc(HeapData::ContextManager(ContextManager::Generator(gen_id)))
            }
            MethodKind::FuncGet => {
                let args = call.no_kwargs(name, self.heap)?;
                let mut args = args.into_iter();
                let obj = args.next().unwrap_or_default();
                args.collect::<Vec<_>>().drop_with_heap(self.heap);
                if obj.is_none() || obj.is_undefined() {
                    obj.drop_with_heap(self.heap);
                    return Ok(receiver.clone_with_heap(self.heap));
                }
                let func = receiver.clone_with_heap(self.heap);
                self.alloc(HeapData::BoundMethod(BoundMethod { func, receiver: obj }))
            }
            _ => {
                let args = call.no_kwargs(name, self.heap)?;
                match method {
                    MethodKind::CmEnter | MethodKind::CmExit | MethodKind::CmAenter | MethodKind::CmAexit => {
                        self.call_cm_method(method, receiver, args)
                    }
                    MethodKind::GenSend
                    | MethodKind::GenThrow
                    | MethodKind::GenClose
                    | MethodKind::GenNext
                    | MethodKind::CoroAwait
                    | MethodKind::AsyncGenAsend
                    | MethodKind::AsyncGenAthrow
                    | MethodKind::AsyncGenAclose
                    | MethodKind::AsyncGenAnext
                    | MethodKind::AsyncGenAiter => self.call_generator_method(method, receiver, args),
                    _ => self.call_container_method(method, receiver, args),
                }
            }
        }
    }

    /// Allocates `receiver.method` as a bound native method (new reference).
    pub(crate) fn bind_native(&mut self, receiver: &Value, method: MethodKind) -> RunResult<Value> {
        let receiver = receiver.clone_with_heap(self.heap);
        self.alloc(HeapData::BuiltinMethod(BuiltinMethod { receiver, method }))
    }
}

/// Purely positional call matching the signature exactly, with no cells to
/// capture from arguments and no `*args`/`**kwargs`.
fn is_simple_call(callee: &Callee, args: &CallArgs) -> bool {
    let code = &callee.code;
    args.kwargs.is_empty()
        && code.kwonlyargcount == 0
        && args.args.len() == code.argcount as usize
        && !code.flags.contains(CodeFlags::VARARGS)
        && !code.flags.contains(CodeFlags::VARKEYWORDS)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, CodeFlags, Exception, Object, Runner, bytecode::make_function_flags};

    /// Module that defines `f(a, b=1, *args, c, d=2, **kw)` returning its locals
    /// as a tuple, then evaluates `call` against it.
    fn call_f(call: impl FnOnce(&mut CodeBuilder)) -> Result<Object, Exception> {
        let mut f = CodeBuilder::function("f")
            .args(&["a", "b"])
            .kwonly(&["c", "d"])
            .varargs("args")
            .varkeywords("kw");
        for name in ["a", "b", "args", "c", "d", "kw"] {
            f.load_fast(name);
        }
        f.emit_arg(crate::Opcode::BuildTuple, 6);
        f.return_value();
        let f = f.build();

        let mut m = CodeBuilder::module("<test>");
        m.load_const(1);
        m.emit_arg(crate::Opcode::BuildTuple, 1);
        m.load_const("d");
        m.load_const(2);
        m.emit_arg(crate::Opcode::BuildMap, 1);
        m.make_function(f, make_function_flags::DEFAULTS | make_function_flags::KWDEFAULTS);
        m.store_name("f");
        m.load_name("f");
        call(&mut m);
        m.return_value();
        Runner::new(m.build()).run_no_limits()
    }

    #[test]
    fn missing_required_arguments_are_listed_together() {
        let err = call_f(|m| m.call_function(0)).unwrap_err();
        assert_eq!(err.summary(), "TypeError: f() missing 1 required positional argument: 'a'");
    }

    #[test]
    fn missing_keyword_only_argument() {
        let err = call_f(|m| {
            m.load_const(10);
            m.call_function(1);
        })
        .unwrap_err();
        assert_eq!(err.summary(), "TypeError: f() missing 1 required keyword-only argument: 'c'");
    }

    #[test]
    fn keyword_conflicts_with_positional() {
        let err = call_f(|m| {
            m.load_const(1);
            m.load_const(2);
            m.load_const(crate::Const::Tuple(vec!["a".into()]));
            m.emit_arg(crate::Opcode::CallFunctionKw, 2);
        })
        .unwrap_err();
        assert_eq!(err.summary(), "TypeError: f() got multiple values for argument 'a'");
    }

    #[test]
    fn binds_every_parameter_kind() {
        let result = call_f(|m| {
            m.load_const(10);
            m.load_const(20);
            m.load_const(30);
            m.load_const(40);
            m.load_const(50);
            m.load_const(crate::Const::Tuple(vec!["c".into(), "z".into()]));
            m.emit_arg(crate::Opcode::CallFunctionKw, 5);
        })
        .unwrap();
        assert_eq!(result.to_string(), "(10, 20, (30,), 40, 2, {'z': 50})");
    }

    /// Defines `f` with the given parameter shape returning `names` as a tuple,
    /// then evaluates `call` against it.
    fn call_shape(
        f: CodeBuilder,
        names: &[&str],
        kwdefaults: Option<(&str, i64)>,
        call: impl FnOnce(&mut CodeBuilder),
    ) -> Result<Object, Exception> {
        let mut f = f;
        for name in names {
            f.load_fast(name);
        }
        f.emit_arg(crate::Opcode::BuildTuple, u32::try_from(names.len()).unwrap());
        f.return_value();

        let mut m = CodeBuilder::module("<test>");
        let flags = match kwdefaults {
            Some((name, value)) => {
                m.load_const(name);
                m.load_const(value);
                m.emit_arg(crate::Opcode::BuildMap, 1);
                make_function_flags::KWDEFAULTS
            }
            None => 0,
        };
        m.make_function(f.build(), flags);
        m.store_name("f");
        m.load_name("f");
        call(&mut m);
        m.return_value();
        Runner::new(m.build()).run_no_limits()
    }

    #[test]
    fn extra_positionals_go_to_varargs() {
        let f = CodeBuilder::function("f").args(&["a"]).varargs("args");
        let result = call_shape(f, &["a", "args"], None, |m| {
            for i in 1..=3 {
                m.load_const(i);
            }
            m.call_function(3);
        });
        assert_eq!(result.unwrap().to_string(), "(1, (2, 3))");
    }

    #[test]
    fn unknown_keyword_goes_to_kwargs_next_to_varargs() {
        let f = CodeBuilder::function("f").args(&["a"]).varargs("args").varkeywords("kw");
        let result = call_shape(f, &["a", "args", "kw"], None, |m| {
            m.load_const(1);
            m.load_const(2);
            m.load_const(crate::Const::Tuple(vec!["x".into()]));
            m.emit_arg(crate::Opcode::CallFunctionKw, 2);
        });
        assert_eq!(result.unwrap().to_string(), "(1, (), {'x': 2})");
    }

    #[test]
    fn var_parameter_names_are_not_keyword_targets() {
        let f = CodeBuilder::function("f").varargs("args").varkeywords("kw");
        let result = call_shape(f, &["args", "kw"], None, |m| {
            m.load_const(1);
            m.load_const(crate::Const::Tuple(vec!["args".into()]));
            m.emit_arg(crate::Opcode::CallFunctionKw, 1);
        });
        assert_eq!(result.unwrap().to_string(), "((), {'args': 1})");
    }

    #[test]
    fn keyword_only_default_after_varargs() {
        let f = CodeBuilder::function("f").varargs("args").kwonly(&["c"]);
        let result = call_shape(f, &["args", "c"], Some(("c", 5)), |m| {
            m.load_const(1);
            m.call_function(1);
        });
        assert_eq!(result.unwrap().to_string(), "((1,), 5)");
    }

    #[test]
    fn too_many_positional_without_varargs() {
        let mut g = CodeBuilder::function("g").args(&["x"]);
        g.load_none();
        g.return_value();
        let mut m = CodeBuilder::module("<test>");
        m.make_function(g.build(), 0);
        m.load_const(1);
        m.load_const(2);
        m.call_function(2);
        m.return_value();
        let err = Runner::new(m.build()).run_no_limits().unwrap_err();
        assert_eq!(
            err.summary(),
            "TypeError: g() takes 1 positional argument but 2 were given"
        );
    }

    #[test]
    fn generator_function_returns_generator_without_running() {
        let mut g = CodeBuilder::function("gen").flags(CodeFlags::GENERATOR);
        g.load_name("undefined_name");
        g.return_value();
        let mut m = CodeBuilder::module("<test>");
        m.make_function(g.build(), 0);
        m.call_function(0);
        m.load_attr("gi_running");
        m.return_value();
        assert_eq!(Runner::new(m.build()).run_no_limits().unwrap(), Object::Bool(false));
    }
}
