//! Python builtin functions and types.
//!
//! Every builtin is a variant of [`Builtins`]; calls are dispatched by
//! [`VM::call_builtin`]. Builtins that need to drive iterators or call back into
//! Python code live on the VM, the rest only need the heap.

mod containers;
mod contextlib;
mod convert;
mod isinstance;
mod iteration;
mod methods;
mod print;

use std::fmt::Write;

use strum::{EnumIter, IntoStaticStr};

use crate::{
    bytecode::vm::{CallArgs, VM},
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

/// Interpreter-native builtins, named by their Python spelling.
///
/// The last few are not in the builtins namespace; the `sys` and `contextlib`
/// modules expose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Builtins {
    Abs,
    Bool,
    Callable,
    Dict,
    Float,
    #[strum(serialize = "__import__")]
    Import,
    Int,
    Isinstance,
    Iter,
    Len,
    List,
    Max,
    Min,
    Next,
    Print,
    Range,
    Repr,
    Set,
    Str,
    Sum,
    Tuple,
    /// `sys.exc_info`
    #[strum(serialize = "exc_info")]
    ExcInfo,
    /// `contextlib.suppress`
    Suppress,
    /// `contextlib.nullcontext`
    NullContext,
    /// `contextlib.contextmanager`
    ContextManager,
}

impl Builtins {
    /// Whether the builtin is bound in the builtins namespace.
    pub fn is_global(self) -> bool {
        !matches!(
            self,
            Self::ExcInfo | Self::Suppress | Self::NullContext | Self::ContextManager
        )
    }

    /// Whether the builtin is a class rather than a function.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::Dict
                | Self::Float
                | Self::Int
                | Self::List
                | Self::Range
                | Self::Set
                | Self::Str
                | Self::Tuple
                | Self::Suppress
                | Self::NullContext
        )
    }

    pub fn type_name(self) -> &'static str {
        if self.is_type() {
            "type"
        } else if self == Self::ContextManager {
            "function"
        } else {
            "builtin_function_or_method"
        }
    }

    pub fn repr_into(self, out: &mut String) {
        let name: &'static str = self.into();
        let _ = match self {
            Self::Suppress | Self::NullContext => write!(out, "<class 'contextlib.{name}'>"),
            Self::ContextManager => write!(out, "<function {name}>"),
            _ if self.is_type() => write!(out, "<class '{name}'>"),
            _ => write!(out, "<built-in function {name}>"),
        };
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Calls `builtin` with `call`, returning a new reference.
    pub(crate) fn call_builtin(&mut self, builtin: Builtins, call: CallArgs) -> RunResult<Value> {
        match builtin {
            Builtins::Print => self.builtin_print(call),
            Builtins::Dict => self.builtin_dict(call),
            Builtins::Min => self.builtin_min_max(call, true),
            Builtins::Max => self.builtin_min_max(call, false),
            Builtins::Import => self.builtin_import(call),
            _ => {
                let name: &'static str = builtin.into();
                let args = call.no_kwargs(name, self.heap)?;
                match builtin {
                    Builtins::Abs => isinstance::builtin_abs(self.heap, args),
                    Builtins::Bool => convert::builtin_bool(self.heap, args),
                    Builtins::Callable => {
                        let value = one_arg(self.heap, "callable", args)?;
                        let callable = self.is_callable(&value);
                        value.drop_with_heap(self.heap);
                        Ok(Value::Bool(callable))
                    }
                    Builtins::Float => convert::builtin_float(self.heap, args),
                    Builtins::Int => convert::builtin_int(self.heap, args),
                    Builtins::Isinstance => isinstance::builtin_isinstance(self.heap, args),
                    Builtins::Iter => self.builtin_iter(args),
                    Builtins::Len => containers::builtin_len(self.heap, args),
                    Builtins::List => self.builtin_list(args),
                    Builtins::Next => self.builtin_next(args),
                    Builtins::Range => containers::builtin_range(self.heap, args),
                    Builtins::Repr => convert::builtin_repr(self.heap, args),
                    Builtins::Set => self.builtin_set(args),
                    Builtins::Str => convert::builtin_str(self.heap, args),
                    Builtins::Sum => self.builtin_sum(args),
                    Builtins::Tuple => self.builtin_tuple(args),
                    Builtins::ExcInfo => self.builtin_exc_info(args),
                    Builtins::Suppress => contextlib::builtin_suppress(self.heap, args),
                    Builtins::NullContext => contextlib::builtin_nullcontext(self.heap, args),
                    Builtins::ContextManager => self.builtin_contextmanager(args),
                    Builtins::Print | Builtins::Dict | Builtins::Min | Builtins::Max | Builtins::Import => {
                        unreachable!("handled above")
                    }
                }
            }
        }
    }
}

/// Exactly one positional argument: `name() takes exactly one argument (N given)`.
pub(crate) fn one_arg(heap: &mut Heap<impl ResourceTracker>, name: &str, args: Vec<Value>) -> RunResult<Value> {
    if args.len() == 1 {
        return Ok(args.into_iter().next().unwrap_or_default());
    }
    let given = args.len();
    args.drop_with_heap(heap);
    Err(ExcType::type_error(format!(
        "{name}() takes exactly one argument ({given} given)"
    )))
}

/// Between `min` and `max` positional arguments, with the messages of
/// `PyArg_UnpackTuple`: `range expected at least 1 arguments, got 0`.
pub(crate) fn unpack_args(
    heap: &mut Heap<impl ResourceTracker>,
    name: &str,
    args: Vec<Value>,
    min: usize,
    max: usize,
) -> RunResult<Vec<Value>> {
    let given = args.len();
    if (min..=max).contains(&given) {
        return Ok(args);
    }
    args.drop_with_heap(heap);
    let (qualifier, bound) = if given < min {
        (if min == max { "" } else { "at least " }, min)
    } else {
        (if min == max { "" } else { "at most " }, max)
    };
    Err(ExcType::type_error(format!(
        "{name} expected {qualifier}{bound} arguments, got {given}"
    )))
}

/// At most `max` positional arguments: `int() takes at most 2 arguments (3 given)`.
pub(crate) fn at_most(heap: &mut Heap<impl ResourceTracker>, name: &str, args: Vec<Value>, max: usize) -> RunResult<Vec<Value>> {
    if args.len() <= max {
        return Ok(args);
    }
    let given = args.len();
    args.drop_with_heap(heap);
    let plural = if max == 1 { "" } else { "s" };
    Err(ExcType::type_error(format!(
        "{name}() takes at most {max} argument{plural} ({given} given)"
    )))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    use super::Builtins;

    #[test]
    fn reprs_distinguish_types_from_functions() {
        let mut out = String::new();
        Builtins::Int.repr_into(&mut out);
        out.push(' ');
        Builtins::Len.repr_into(&mut out);
        out.push(' ');
        Builtins::Import.repr_into(&mut out);
        assert_eq!(out, "<class 'int'> <built-in function len> <built-in function __import__>");
    }

    #[test]
    fn module_only_builtins_are_not_global() {
        let module_only: Vec<&'static str> = Builtins::iter()
            .filter(|b| !b.is_global())
            .map(Into::into)
            .collect();
        assert_eq!(module_only, ["exc_info", "suppress", "nullcontext", "contextmanager"]);
    }
}
