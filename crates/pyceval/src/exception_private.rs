use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    resource::ResourceTracker,
    types::ExceptionObject,
    value::Value,
};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Built-in exception classes.
///
/// The string representation matches the variant name exactly, which is also the
/// name the class is bound to in the builtins namespace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr, Serialize, Deserialize,
)]
pub enum ExcType {
    BaseException,
    SystemExit,
    KeyboardInterrupt,
    /// Raised inside a generator by `close()`. Derives from BaseException, not Exception.
    GeneratorExit,
    Exception,

    StopIteration,
    StopAsyncIteration,

    ArithmeticError,
    FloatingPointError,
    OverflowError,
    ZeroDivisionError,

    AssertionError,
    AttributeError,
    BufferError,
    EOFError,

    ImportError,
    ModuleNotFoundError,

    LookupError,
    IndexError,
    KeyError,

    MemoryError,

    NameError,
    UnboundLocalError,

    OSError,
    TimeoutError,

    ReferenceError,

    RuntimeError,
    NotImplementedError,
    RecursionError,

    SyntaxError,
    SystemError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Returns the direct base class, or `None` for `BaseException`.
    #[must_use]
    pub fn base(self) -> Option<Self> {
        Some(match self {
            Self::BaseException => return None,
            Self::SystemExit | Self::KeyboardInterrupt | Self::GeneratorExit | Self::Exception => Self::BaseException,
            Self::FloatingPointError | Self::OverflowError | Self::ZeroDivisionError => Self::ArithmeticError,
            Self::ModuleNotFoundError => Self::ImportError,
            Self::IndexError | Self::KeyError => Self::LookupError,
            Self::UnboundLocalError => Self::NameError,
            Self::TimeoutError => Self::OSError,
            Self::NotImplementedError | Self::RecursionError => Self::RuntimeError,
            _ => Self::Exception,
        })
    }

    /// Checks whether `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t == handler_type {
                return true;
            }
            current = t.base();
        }
        false
    }

    /// Creates a TypeError with the given message.
    #[must_use]
    pub(crate) fn type_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    #[must_use]
    pub(crate) fn value_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::ValueError, msg).into()
    }

    #[must_use]
    pub(crate) fn runtime_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::RuntimeError, msg).into()
    }

    /// SystemError is reserved for broken invariants of the instruction stream.
    #[must_use]
    pub(crate) fn system_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::SystemError, msg).into()
    }

    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    /// Reading a plain local slot that was never assigned.
    #[must_use]
    pub(crate) fn unbound_local(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
        .into()
    }

    /// Reading a free variable whose cell in the enclosing scope is still empty.
    #[must_use]
    pub(crate) fn unbound_free(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::NameError,
            format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn attribute_error(type_name: &str, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn type_error_not_iterable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    #[must_use]
    pub(crate) fn type_error_not_callable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    #[must_use]
    pub(crate) fn type_error_unhashable(type_name: &str) -> RunError {
        Self::type_error(format!("unhashable type: '{type_name}'"))
    }

    #[must_use]
    pub(crate) fn type_error_not_subscriptable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not subscriptable"))
    }

    #[must_use]
    pub(crate) fn type_error_unsupported_binary(op: &str, left: &str, right: &str) -> RunError {
        Self::type_error(format!(
            "unsupported operand type(s) for {op}: '{left}' and '{right}'"
        ))
    }

    #[must_use]
    pub(crate) fn type_error_unorderable(op: &str, left: &str, right: &str) -> RunError {
        Self::type_error(format!(
            "'{op}' not supported between instances of '{left}' and '{right}'"
        ))
    }

    #[must_use]
    pub(crate) fn type_error_bad_operand_unary(op: &str, type_name: &str) -> RunError {
        Self::type_error(format!("bad operand type for unary {op}: '{type_name}'"))
    }

    #[must_use]
    pub(crate) fn zero_division(msg: &'static str) -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, msg).into()
    }

    #[must_use]
    pub(crate) fn overflow(msg: &'static str) -> RunError {
        SimpleException::new_msg(Self::OverflowError, msg).into()
    }

    /// `KeyError` for a string key; `str()` of the exception shows the key quoted.
    #[must_use]
    pub(crate) fn key_error_str(key: &str) -> RunError {
        SimpleException::new_msg(Self::KeyError, key).into()
    }

    #[must_use]
    pub(crate) fn index_error(msg: &'static str) -> RunError {
        SimpleException::new_msg(Self::IndexError, msg).into()
    }

    /// Builds the binding error for required parameters that received no value.
    ///
    /// `kind` is either `"positional"` or `"keyword-only"`.
    #[must_use]
    pub(crate) fn type_error_missing_arguments(func_name: &str, kind: &str, missing: &[&str]) -> RunError {
        let plural = if missing.len() == 1 { "" } else { "s" };
        Self::type_error(format!(
            "{func_name}() missing {} required {kind} argument{plural}: {}",
            missing.len(),
            join_param_names(missing)
        ))
    }

    /// Builds the binding error for surplus positional arguments.
    ///
    /// `defcount` is the number of positional defaults, `kwonly_given` the number of
    /// keyword-only parameters that were bound.
    #[must_use]
    pub(crate) fn type_error_too_many_positional(
        func_name: &str,
        argcount: usize,
        defcount: usize,
        given: usize,
        kwonly_given: usize,
    ) -> RunError {
        let (sig, plural) = if defcount > 0 {
            (format!("from {} to {argcount}", argcount - defcount), true)
        } else {
            (argcount.to_string(), argcount != 1)
        };
        let kwonly_sig = if kwonly_given > 0 {
            format!(
                " positional argument{} (and {kwonly_given} keyword-only argument{})",
                if given == 1 { "" } else { "s" },
                if kwonly_given == 1 { "" } else { "s" },
            )
        } else {
            String::new()
        };
        let verb = if given == 1 && kwonly_given == 0 { "was" } else { "were" };
        Self::type_error(format!(
            "{func_name}() takes {sig} positional argument{} but {given}{kwonly_sig} {verb} given",
            if plural { "s" } else { "" },
        ))
    }

    #[must_use]
    pub(crate) fn type_error_multiple_values(func_name: &str, param: &str) -> RunError {
        Self::type_error(format!("{func_name}() got multiple values for argument '{param}'"))
    }

    #[must_use]
    pub(crate) fn type_error_unexpected_keyword(func_name: &str, key: &str) -> RunError {
        Self::type_error(format!("{func_name}() got an unexpected keyword argument '{key}'"))
    }

    #[must_use]
    pub(crate) fn type_error_keywords_must_be_strings(func_name: &str) -> RunError {
        Self::type_error(format!("{func_name}() keywords must be strings"))
    }
}

/// Joins quoted parameter names in natural language.
///
/// - `["a"]` -> `'a'`
/// - `["a", "b"]` -> `'a' and 'b'`
/// - `["a", "b", "c"]` -> `'a', 'b', and 'c'`
pub(crate) fn join_param_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [one] => format!("'{one}'"),
        [first, second] => format!("'{first}' and '{second}'"),
        [rest @ .., second_last, last] => {
            let head: Vec<String> = rest.iter().map(|n| format!("'{n}'")).collect();
            format!("{}, '{second_last}', and '{last}'", head.join(", "))
        }
    }
}

/// An exception that has not been materialized on the heap yet.
///
/// Most errors raised by the object model never reach a handler that inspects
/// them, so they travel as a type plus message until an `except` block (or the
/// host) needs a real instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleException {
    exc_type: ExcType,
    arg: Option<String>,
}

impl SimpleException {
    #[must_use]
    pub fn new(exc_type: ExcType, arg: Option<String>) -> Self {
        Self { exc_type, arg }
    }

    #[must_use]
    pub fn new_msg(exc_type: ExcType, arg: impl fmt::Display) -> Self {
        Self {
            exc_type,
            arg: Some(arg.to_string()),
        }
    }

    #[must_use]
    pub fn new_none(exc_type: ExcType) -> Self {
        Self { exc_type, arg: None }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn arg(&self) -> Option<&str> {
        self.arg.as_deref()
    }

    pub(crate) fn into_arg(self) -> Option<String> {
        self.arg
    }
}

/// One traceback entry: where the frame's code lives and the line that was executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub filename: String,
    pub name: String,
    pub line: u32,
}

/// The payload of a raised exception.
#[derive(Debug)]
pub(crate) enum RaisedValue {
    /// Not yet normalized into a heap instance.
    Simple(SimpleException),
    /// A heap `ExceptionObject`; the raise owns one reference.
    Instance(HeapId),
}

/// An exception in flight, together with the traceback accumulated while it
/// propagated through frames (innermost first).
#[derive(Debug)]
pub(crate) struct ExceptionRaise {
    pub value: RaisedValue,
    pub traceback: Vec<TraceFrame>,
    /// Set once `__context__` has been attached, so the exception is not chained
    /// again while it propagates through outer frames.
    pub chained: bool,
}

impl From<SimpleException> for ExceptionRaise {
    fn from(exc: SimpleException) -> Self {
        Self {
            value: RaisedValue::Simple(exc),
            traceback: Vec::new(),
            chained: false,
        }
    }
}

impl ExceptionRaise {
    /// Wraps an owned heap exception instance.
    pub fn from_instance(id: HeapId, traceback: Vec<TraceFrame>) -> Self {
        Self {
            value: RaisedValue::Instance(id),
            traceback,
            chained: false,
        }
    }

    /// Returns the class of the raised exception.
    pub fn exc_type(&self, heap: &Heap<impl ResourceTracker>) -> ExcType {
        match &self.value {
            RaisedValue::Simple(exc) => exc.exc_type(),
            RaisedValue::Instance(id) => match heap.get(*id) {
                HeapData::Exception(exc) => exc.exc_type,
                _ => ExcType::SystemError,
            },
        }
    }

    /// Ensures the payload is a heap instance and returns its id (borrowed).
    ///
    /// Mirrors `PyErr_NormalizeException`: lazy exceptions become real objects the
    /// first time a handler needs them.
    pub fn normalize(&mut self, heap: &mut Heap<impl ResourceTracker>) -> RunResult<HeapId> {
        if let RaisedValue::Simple(simple) = &self.value {
            let obj = ExceptionObject::from_simple(simple.clone(), heap)?;
            let id = heap.allocate(HeapData::Exception(obj))?;
            self.value = RaisedValue::Instance(id);
        }
        match &self.value {
            RaisedValue::Instance(id) => Ok(*id),
            RaisedValue::Simple(_) => unreachable!("normalized above"),
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ExceptionRaise {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let RaisedValue::Instance(id) = self.value {
            heap.dec_ref(id);
        }
    }
}

/// Runtime error types that can occur during evaluation.
///
/// - `Internal`: a bug in the interpreter, never expected in normal operation
/// - `Exc`: a Python exception that handlers may catch
/// - `UncatchableExc`: a resource-limit exception that skips every handler
#[derive(Debug)]
pub(crate) enum RunError {
    Internal(Cow<'static, str>),
    Exc(Box<ExceptionRaise>),
    UncatchableExc(Box<ExceptionRaise>),
}

impl From<ExceptionRaise> for RunError {
    fn from(exc: ExceptionRaise) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc.into()))
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the exception class for catchable and uncatchable errors.
    pub fn exc_type(&self, heap: &Heap<impl ResourceTracker>) -> Option<ExcType> {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => Some(exc.exc_type(heap)),
            Self::Internal(_) => None,
        }
    }

    /// True if this is a catchable exception matching `exc_type` or a subclass.
    pub fn matches(&self, exc_type: ExcType, heap: &Heap<impl ResourceTracker>) -> bool {
        match self {
            Self::Exc(exc) => exc.exc_type(heap).is_subclass_of(exc_type),
            _ => false,
        }
    }

    /// The heap instance being raised, if it has been normalized.
    pub fn instance_id(&self) -> Option<HeapId> {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => match exc.value {
                RaisedValue::Instance(id) => Some(id),
                RaisedValue::Simple(_) => None,
            },
            Self::Internal(_) => None,
        }
    }

    /// Traceback accumulated so far, if any.
    pub fn traceback_mut(&mut self) -> Option<&mut Vec<TraceFrame>> {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => Some(&mut exc.traceback),
            Self::Internal(_) => None,
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for RunError {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => exc.drop_with_heap(heap),
            Self::Internal(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hierarchy() {
        assert!(ExcType::KeyError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::KeyError.is_subclass_of(ExcType::Exception));
        assert!(ExcType::UnboundLocalError.is_subclass_of(ExcType::NameError));
        assert!(ExcType::GeneratorExit.is_subclass_of(ExcType::BaseException));
        assert!(!ExcType::GeneratorExit.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::Exception.is_subclass_of(ExcType::KeyError));
    }

    #[test]
    fn param_names_join() {
        assert_eq!(join_param_names(&["a"]), "'a'");
        assert_eq!(join_param_names(&["a", "b"]), "'a' and 'b'");
        assert_eq!(join_param_names(&["a", "b", "c"]), "'a', 'b', and 'c'");
        assert_eq!(join_param_names(&["a", "b", "c", "d"]), "'a', 'b', 'c', and 'd'");
    }

    fn message(err: RunError) -> String {
        match err {
            RunError::Exc(exc) => match exc.value {
                RaisedValue::Simple(simple) => simple.into_arg().unwrap_or_default(),
                RaisedValue::Instance(_) => panic!("expected lazy exception"),
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn too_many_positional_messages() {
        assert_eq!(
            message(ExcType::type_error_too_many_positional("f", 1, 0, 2, 0)),
            "f() takes 1 positional argument but 2 were given"
        );
        assert_eq!(
            message(ExcType::type_error_too_many_positional("f", 0, 0, 1, 0)),
            "f() takes 0 positional arguments but 1 was given"
        );
        assert_eq!(
            message(ExcType::type_error_too_many_positional("f", 3, 2, 4, 0)),
            "f() takes from 1 to 3 positional arguments but 4 were given"
        );
        assert_eq!(
            message(ExcType::type_error_too_many_positional("f", 1, 0, 2, 1)),
            "f() takes 1 positional argument but 2 positional arguments (and 1 keyword-only argument) were given"
        );
    }

    #[test]
    fn missing_arguments_message() {
        assert_eq!(
            message(ExcType::type_error_missing_arguments("f", "keyword-only", &["c"])),
            "f() missing 1 required keyword-only argument: 'c'"
        );
        assert_eq!(
            message(ExcType::type_error_missing_arguments("f", "positional", &["a", "b", "c"])),
            "f() missing 3 required positional arguments: 'a', 'b', and 'c'"
        );
    }
}
