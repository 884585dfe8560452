//! Attribute access on built-in objects: `LOAD_ATTR`, `STORE_ATTR`, `DELETE_ATTR`.

use crate::{
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{ContextManager, Dict, ExceptionObject, GenKind, HashKey, MethodKind, dict_get_item, dict_set_item},
    value::Value,
};

use super::{Frame, VM};

const LIST_METHODS: &[MethodKind] = &[MethodKind::ListAppend, MethodKind::ListPop, MethodKind::ListExtend];
const DICT_METHODS: &[MethodKind] = &[
    MethodKind::DictKeys,
    MethodKind::DictItems,
    MethodKind::DictValues,
    MethodKind::DictGet,
];
const GENERATOR_METHODS: &[MethodKind] = &[
    MethodKind::GenSend,
    MethodKind::GenThrow,
    MethodKind::GenClose,
    MethodKind::GenNext,
];
const COROUTINE_METHODS: &[MethodKind] = &[
    MethodKind::GenSend,
    MethodKind::GenThrow,
    MethodKind::GenClose,
    MethodKind::CoroAwait,
];
const ASYNC_GEN_METHODS: &[MethodKind] = &[
    MethodKind::AsyncGenAsend,
    MethodKind::AsyncGenAthrow,
    MethodKind::AsyncGenAclose,
    MethodKind::AsyncGenAnext,
    MethodKind::AsyncGenAiter,
];
const SYNC_CM_METHODS: &[MethodKind] = &[MethodKind::CmEnter, MethodKind::CmExit];
const ANY_CM_METHODS: &[MethodKind] = &[
    MethodKind::CmEnter,
    MethodKind::CmExit,
    MethodKind::CmAenter,
    MethodKind::CmAexit,
];

/// Native methods a heap object exposes, looked up on its type.
fn methods_of(data: &HeapData) -> &'static [MethodKind] {
    match data {
        HeapData::List(_) => LIST_METHODS,
        HeapData::Dict(_) => DICT_METHODS,
        HeapData::Str(_) => &[MethodKind::StrJoin],
        HeapData::Generator(g) => match g.kind {
            GenKind::Generator => GENERATOR_METHODS,
            GenKind::Coroutine => COROUTINE_METHODS,
            GenKind::AsyncGenerator => ASYNC_GEN_METHODS,
        },
        HeapData::CoroutineWrapper(_) | HeapData::AsyncGenAwaitable(_) => GENERATOR_METHODS,
        HeapData::Iter(_) => &[MethodKind::GenNext],
        HeapData::Function(_) => &[MethodKind::FuncGet],
        HeapData::ContextManager(ContextManager::NullContext(_)) => ANY_CM_METHODS,
        HeapData::ContextManager(_) => SYNC_CM_METHODS,
        _ => &[],
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn load_attr_op(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let owner = frame.pop();
        let result = match frame.code.names.get(index) {
            Some(name) => self.load_attr(&owner, name),
            None => Err(RunError::internal("name index out of range")),
        };
        owner.drop_with_heap(self.heap);
        frame.push(result?);
        Ok(())
    }

    /// `STORE_ATTR`: `TOS.name = TOS1`.
    pub(super) fn store_attr_op(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let owner = frame.pop();
        let value = frame.pop();
        let result = match frame.code.names.get(index) {
            Some(name) => self.store_attr(&owner, name, value),
            None => {
                value.drop_with_heap(self.heap);
                Err(RunError::internal("name index out of range"))
            }
        };
        owner.drop_with_heap(self.heap);
        result
    }

    pub(super) fn delete_attr_op(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let owner = frame.pop();
        let result = match frame.code.names.get(index) {
            Some(name) => self.delete_attr(&owner, name),
            None => Err(RunError::internal("name index out of range")),
        };
        owner.drop_with_heap(self.heap);
        result
    }

    /// The native method `name` on the type of `obj`, if there is one.
    pub(crate) fn native_method(&self, obj: &Value, name: &str) -> Option<MethodKind> {
        let id = obj.ref_id()?;
        methods_of(self.heap.get(id))
            .iter()
            .copied()
            .find(|method| <&'static str>::from(*method) == name)
    }

    /// `getattr(obj, name)` (new reference). `obj` is borrowed.
    pub(crate) fn load_attr(&mut self, obj: &Value, name: &str) -> RunResult<Value> {
        if let Some(method) = self.native_method(obj, name) {
            return self.bind_native(obj, method);
        }
        let found = match obj {
            Value::Ref(id) => self.heap_attr(*id, name)?,
            Value::Builtin(builtin) if name == "__name__" => {
                let type_name: &'static str = (*builtin).into();
                Some(self.heap.alloc_str(type_name)?)
            }
            Value::ExcClass(exc_type) if name == "__name__" => {
                let type_name: &'static str = (*exc_type).into();
                Some(self.heap.alloc_str(type_name)?)
            }
            _ => None,
        };
        found.ok_or_else(|| self.missing_attr(obj, name))
    }

    fn missing_attr(&self, obj: &Value, name: &str) -> RunError {
        match obj {
            Value::ExcClass(exc_type) => SimpleException::new_msg(
                ExcType::AttributeError,
                format!("type object '{exc_type}' has no attribute '{name}'"),
            )
            .into(),
            Value::Builtin(builtin) if builtin.is_type() => {
                let type_name: &'static str = (*builtin).into();
                SimpleException::new_msg(
                    ExcType::AttributeError,
                    format!("type object '{type_name}' has no attribute '{name}'"),
                )
                .into()
            }
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Module(m) => SimpleException::new_msg(
                    ExcType::AttributeError,
                    format!("module '{}' has no attribute '{name}'", m.name),
                )
                .into(),
                _ => ExcType::attribute_error(obj.type_name(self.heap), name),
            },
            _ => ExcType::attribute_error(obj.type_name(self.heap), name),
        }
    }

    /// Data attributes of heap objects; `Ok(None)` when there is no such attribute.
    fn heap_attr(&mut self, id: HeapId, name: &str) -> RunResult<Option<Value>> {
        let value = match self.heap.get(id) {
            HeapData::Module(module) => {
                let dict = module.dict;
                if name == "__dict__" {
                    self.heap.inc_ref(dict);
                    return Ok(Some(Value::Ref(dict)));
                }
                return Ok(dict_get_item(self.heap, dict, &HashKey::str(name)));
            }
            HeapData::Function(_) => return self.function_attr(id, name),
            HeapData::Exception(exc) => {
                let exc_type = exc.exc_type;
                return self.exception_attr(id, exc_type, name);
            }
            HeapData::Generator(generator) => {
                let prefix = match generator.kind {
                    GenKind::Generator => "gi_",
                    GenKind::Coroutine => "cr_",
                    GenKind::AsyncGenerator => "ag_",
                };
                match name {
                    "__name__" => Str(generator.name.clone()),
                    "__qualname__" => Str(generator.qualname.clone()),
                    _ if name.strip_prefix(prefix) == Some("running") => Immediate(Value::Bool(generator.running)),
                    _ if name.strip_prefix(prefix) == Some("code") => match &generator.frame {
                        Some(frame) => Shared(frame.code_id),
                        None => Immediate(Value::None),
                    },
                    _ => return Ok(None),
                }
            }
            HeapData::BoundMethod(method) => match name {
                "__self__" => Immediate(method.receiver.copy_for_extend()),
                "__func__" => Immediate(method.func.copy_for_extend()),
                _ => return Ok(None),
            },
            HeapData::BuiltinMethod(method) => match name {
                "__self__" => Immediate(method.receiver.copy_for_extend()),
                "__name__" => Str(method.method.to_string()),
                _ => return Ok(None),
            },
            HeapData::Code(code) => match name {
                "co_name" => Str(code.code.name.clone()),
                "co_filename" => Str(code.code.filename.clone()),
                "co_argcount" => Immediate(Value::Int(i64::from(code.code.argcount))),
                "co_kwonlyargcount" => Immediate(Value::Int(i64::from(code.code.kwonlyargcount))),
                "co_flags" => Immediate(Value::Int(i64::from(code.code.flags.bits()))),
                "co_firstlineno" => Immediate(Value::Int(i64::from(code.code.first_line))),
                _ => return Ok(None),
            },
            HeapData::Slice(slice) => match name {
                "start" => Immediate(slice.start.copy_for_extend()),
                "stop" => Immediate(slice.stop.copy_for_extend()),
                "step" => Immediate(slice.step.copy_for_extend()),
                _ => return Ok(None),
            },
            HeapData::Range(range) => match name {
                "start" => Immediate(Value::Int(range.start)),
                "stop" => Immediate(Value::Int(range.stop)),
                "step" => Immediate(Value::Int(range.step)),
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        self.materialize(value).map(Some)
    }

    /// Turns a looked-up attribute into an owned value.
    fn materialize(&mut self, attr: Attr) -> RunResult<Value> {
        match attr {
            Str(s) => Ok(self.heap.alloc_str(s)?),
            Shared(id) => {
                self.heap.inc_ref(id);
                Ok(Value::Ref(id))
            }
            Immediate(value) => {
                if let Value::Ref(id) = &value {
                    self.heap.inc_ref(*id);
                }
                Ok(value)
            }
        }
    }

    fn function_attr(&mut self, id: HeapId, name: &str) -> RunResult<Option<Value>> {
        let HeapData::Function(func) = self.heap.get(id) else {
            return Ok(None);
        };
        let optional = |slot: Option<HeapId>| slot.map_or(Immediate(Value::None), Shared);
        let attr = match name {
            "__name__" => Str(func.name.clone()),
            "__qualname__" => Str(func.qualname.clone()),
            "__code__" => Shared(func.code),
            "__globals__" => Shared(func.globals),
            "__defaults__" => optional(func.defaults),
            "__kwdefaults__" => optional(func.kwdefaults),
            "__closure__" => optional(func.closure),
            "__annotations__" | "__dict__" => {
                let existing = if name == "__dict__" { func.dict } else { func.annotations };
                let dict = match existing {
                    Some(dict) => dict,
                    None => {
                        let dict = self.heap.allocate(HeapData::Dict(Dict::new()))?;
                        if let HeapData::Function(func) = self.heap.get_mut(id) {
                            if name == "__dict__" {
                                func.dict = Some(dict);
                            } else {
                                func.annotations = Some(dict);
                            }
                        }
                        dict
                    }
                };
                Shared(dict)
            }
            _ => match func.dict {
                Some(dict) => return Ok(dict_get_item(self.heap, dict, &HashKey::str(name))),
                None => return Ok(None),
            },
        };
        self.materialize(attr).map(Some)
    }

    fn exception_attr(&mut self, id: HeapId, exc_type: ExcType, name: &str) -> RunResult<Option<Value>> {
        let HeapData::Exception(exc) = self.heap.get(id) else {
            return Ok(None);
        };
        let attr = match name {
            "args" => {
                let args: Vec<Value> = exc.args.iter().map(Value::copy_for_extend).collect();
                self.heap.inc_ref_values(&args);
                return Ok(Some(self.heap.alloc_tuple(args)?));
            }
            "__class__" => Immediate(Value::ExcClass(exc_type)),
            "__cause__" => Immediate(exc.cause.copy_for_extend()),
            "__context__" => Immediate(exc.context.copy_for_extend()),
            "__traceback__" => Immediate(exc.traceback.copy_for_extend()),
            "__suppress_context__" => Immediate(Value::Bool(exc.suppress_context)),
            "value" if exc_type == ExcType::StopIteration => {
                Immediate(exc.first_arg().map_or(Value::None, Value::copy_for_extend))
            }
            _ => return Ok(None),
        };
        self.materialize(attr).map(Some)
    }

    /// `setattr(obj, name, value)`, consuming `value`.
    pub(crate) fn store_attr(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        let target = match obj.ref_id().map(|id| (id, self.heap.get(id))) {
            Some((_, HeapData::Module(m))) => Some(m.dict),
            Some((id, HeapData::Function(_))) => return self.store_function_attr(id, name, value),
            Some((id, HeapData::Exception(_))) if matches!(name, "__cause__" | "__context__") => {
                return self.store_exception_link(id, name, value);
            }
            _ => None,
        };
        let Some(dict) = target else {
            let err = ExcType::attribute_error(obj.type_name(self.heap), name);
            value.drop_with_heap(self.heap);
            return Err(err);
        };
        let key = match self.heap.alloc_str(name) {
            Ok(key) => key,
            Err(e) => {
                value.drop_with_heap(self.heap);
                return Err(e.into());
            }
        };
        dict_set_item(self.heap, dict, key, value)
    }

    fn store_function_attr(&mut self, id: HeapId, name: &str, value: Value) -> RunResult<()> {
        if matches!(name, "__name__" | "__qualname__") {
            let Some(text) = value.as_str(self.heap).map(str::to_owned) else {
                value.drop_with_heap(self.heap);
                return Err(ExcType::type_error(format!("{name} must be set to a string object")));
            };
            value.drop_with_heap(self.heap);
            if let HeapData::Function(func) = self.heap.get_mut(id) {
                if name == "__name__" {
                    func.name = text;
                } else {
                    func.qualname = text;
                }
            }
            return Ok(());
        }
        let existing = match self.heap.get(id) {
            HeapData::Function(func) => func.dict,
            _ => None,
        };
        let dict = match existing {
            Some(dict) => dict,
            None => {
                let dict = match self.heap.allocate(HeapData::Dict(Dict::new())) {
                    Ok(dict) => dict,
                    Err(e) => {
                        value.drop_with_heap(self.heap);
                        return Err(e.into());
                    }
                };
                if let HeapData::Function(func) = self.heap.get_mut(id) {
                    func.dict = Some(dict);
                }
                dict
            }
        };
        let key = match self.heap.alloc_str(name) {
            Ok(key) => key,
            Err(e) => {
                value.drop_with_heap(self.heap);
                return Err(e.into());
            }
        };
        dict_set_item(self.heap, dict, key, value)
    }

    /// `exc.__cause__ = x` / `exc.__context__ = x`; only `None` or an exception instance.
    fn store_exception_link(&mut self, id: HeapId, name: &str, value: Value) -> RunResult<()> {
        let valid = match &value {
            Value::None => true,
            Value::Ref(v) => matches!(self.heap.get(*v), HeapData::Exception(_)),
            _ => false,
        };
        if !valid {
            value.drop_with_heap(self.heap);
            let what = if name == "__cause__" { "cause" } else { "context" };
            return Err(ExcType::type_error(format!(
                "exception {what} must be None or derive from BaseException"
            )));
        }
        let old = match self.heap.get_mut(id) {
            HeapData::Exception(ExceptionObject {
                cause, suppress_context, ..
            }) if name == "__cause__" => {
                *suppress_context = true;
                std::mem::replace(cause, value)
            }
            HeapData::Exception(exc) => std::mem::replace(&mut exc.context, value),
            _ => value,
        };
        old.drop_with_heap(self.heap);
        Ok(())
    }

    pub(crate) fn delete_attr(&mut self, obj: &Value, name: &str) -> RunResult<()> {
        let dict = match obj.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Module(m)) => Some(m.dict),
            Some(HeapData::Function(f)) => f.dict,
            _ => {
                return Err(ExcType::attribute_error(obj.type_name(self.heap), name));
            }
        };
        let removed = dict.and_then(|dict| match self.heap.get_mut(dict) {
            HeapData::Dict(d) => d.remove(&HashKey::str(name)),
            _ => None,
        });
        match removed {
            Some(pair) => {
                pair.drop_with_heap(self.heap);
                Ok(())
            }
            None => Err(SimpleException::new_msg(ExcType::AttributeError, name).into()),
        }
    }
}

/// An attribute found on a heap object, before it is turned into an owned value.
enum Attr {
    Str(String),
    /// A heap object the owner references; a new reference is taken.
    Shared(HeapId),
    /// A copied value; `Ref`s get a new reference when materialized.
    Immediate(Value),
}

use Attr::{Immediate, Shared, Str};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, Exception, Object, Runner};

    fn run(build: impl FnOnce(&mut CodeBuilder)) -> Result<Object, Exception> {
        let mut b = CodeBuilder::module("<test>");
        build(&mut b);
        Runner::new(b.build()).run_no_limits()
    }

    #[test]
    fn function_attributes_round_trip_through_dict() {
        let mut f = CodeBuilder::function("f");
        f.load_none();
        f.return_value();
        let result = run(|b| {
            b.make_function(f.build(), 0);
            b.store_name("f");
            b.load_const(42);
            b.load_name("f");
            b.store_attr("tag");
            b.load_name("f");
            b.load_attr("tag");
            b.load_name("f");
            b.load_attr("__name__");
            b.emit_arg(crate::Opcode::BuildTuple, 2);
            b.return_value();
        });
        assert_eq!(result.unwrap().to_string(), "(42, 'f')");
    }

    #[test]
    fn missing_attribute_names_the_type() {
        let err = run(|b| {
            b.load_const(1);
            b.load_attr("nope");
            b.return_value();
        })
        .unwrap_err();
        assert_eq!(err.summary(), "AttributeError: 'int' object has no attribute 'nope'");
    }

    #[test]
    fn list_methods_are_bound() {
        let result = run(|b| {
            b.emit_arg(crate::Opcode::BuildList, 0);
            b.store_name("xs");
            b.load_name("xs");
            b.load_attr("append");
            b.load_const(7);
            b.call_function(1);
            b.pop_top();
            b.load_name("xs");
            b.return_value();
        });
        assert_eq!(result.unwrap().to_string(), "[7]");
    }
}
