use std::{cmp::Ordering, fmt::Write};

use crate::{
    builtins::Builtins,
    bytecode::vm::PendingUnwind,
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId},
    resource::ResourceTracker,
    types::{GenKind, HashKey},
};

/// Primary value type representing Python objects at runtime.
///
/// Small immediate values (None, bool, int, float, builtin callables and exception
/// classes) are stored inline, everything else lives in the arena and is referenced
/// via `Ref(HeapId)`.
///
/// NOTE: `Clone` is intentionally NOT derived. Use `clone_with_heap()` for heap values
/// or `clone_immediate()` for immediate values only. Direct cloning would bypass
/// reference counting.
#[derive(Debug, Default)]
pub(crate) enum Value {
    /// The "unbound" state of a local slot or cell, and the NULL entries of a saved
    /// exception triple. Never visible to Python code.
    #[default]
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Builtin(Builtins),
    ExcClass(ExcType),
    Ref(HeapId),
    /// Marker pushed by the unwinder before jumping into a `finally` block; see
    /// [`PendingUnwind`]. Never visible to Python code.
    Pending(PendingUnwind),
    /// Placeholder left behind by `drop_with_heap` when `ref-count-panic` is enabled.
    #[cfg(feature = "ref-count-panic")]
    Dereferenced,
}

#[cfg(feature = "ref-count-panic")]
impl Drop for Value {
    fn drop(&mut self) {
        if let Self::Ref(id) = self {
            panic!("Value::Ref({id:?}) dropped without calling drop_with_heap() - this is a reference counting bug");
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl Value {
    /// Clones a value, incrementing its refcount when it lives on the heap.
    pub fn clone_with_heap(&self, heap: &mut Heap<impl ResourceTracker>) -> Self {
        match self {
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
            other => other.clone_immediate(),
        }
    }

    /// Drops a value, decrementing its heap reference count if applicable.
    ///
    /// This method MUST be called before overwriting a slot or discarding a value.
    #[cfg(not(feature = "ref-count-panic"))]
    #[inline]
    pub fn drop_with_heap(self, heap: &mut Heap<impl ResourceTracker>) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// With `ref-count-panic` enabled, `Ref` variants are replaced with `Dereferenced` and
    /// the original is forgotten to prevent the Drop impl from panicking.
    #[cfg(feature = "ref-count-panic")]
    pub fn drop_with_heap(mut self, heap: &mut Heap<impl ResourceTracker>) {
        let old = std::mem::replace(&mut self, Self::Dereferenced);
        if let Self::Ref(id) = &old {
            heap.dec_ref(*id);
            std::mem::forget(old);
        }
    }

    /// Copies an immediate value.
    ///
    /// # Panics
    /// Panics on `Ref`, which must go through `clone_with_heap`.
    pub fn clone_immediate(&self) -> Self {
        match self {
            Self::Ref(_) => panic!("Ref clones must go through clone_with_heap to maintain refcounts"),
            _ => self.copy_for_extend(),
        }
    }

    /// Shallow copy WITHOUT touching refcounts. The caller must `inc_ref` any `Ref`.
    pub(crate) fn copy_for_extend(&self) -> Self {
        match self {
            Self::Undefined => Self::Undefined,
            Self::None => Self::None,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => Self::Float(*f),
            Self::Builtin(b) => Self::Builtin(*b),
            Self::ExcClass(e) => Self::ExcClass(*e),
            Self::Ref(id) => Self::Ref(*id),
            Self::Pending(p) => Self::Pending(*p),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("Cannot copy Dereferenced object"),
        }
    }

    /// Consumes a `Value` whose refcount was already transferred elsewhere.
    #[inline]
    pub(crate) fn forget(self) {
        std::mem::forget(self);
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the heap id for `Ref` values.
    #[inline]
    pub fn ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Python `is`.
    pub fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ExcClass(a), Self::ExcClass(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// Returns the Python type name of this value.
    pub fn type_name(&self, heap: &Heap<impl ResourceTracker>) -> &'static str {
        match self {
            Self::Undefined | Self::Pending(_) => "NULL",
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Builtin(b) => b.type_name(),
            Self::ExcClass(_) => "type",
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(_) => "str",
                HeapData::List(_) => "list",
                HeapData::Tuple(_) => "tuple",
                HeapData::Dict(_) => "dict",
                HeapData::Set(_) => "set",
                HeapData::Cell(_) => "cell",
                HeapData::Code(_) => "code",
                HeapData::Function(_) => "function",
                HeapData::BoundMethod(_) => "method",
                HeapData::BuiltinMethod(_) => "builtin_function_or_method",
                HeapData::Exception(e) => e.exc_type.into(),
                HeapData::Traceback(_) => "traceback",
                HeapData::Generator(g) => match g.kind {
                    GenKind::Generator => "generator",
                    GenKind::Coroutine => "coroutine",
                    GenKind::AsyncGenerator => "async_generator",
                },
                HeapData::Iter(it) => it.type_name(),
                HeapData::Range(_) => "range",
                HeapData::Slice(_) => "slice",
                HeapData::Module(_) => "module",
                HeapData::ContextManager(cm) => cm.type_name(),
                HeapData::AsyncGenWrapped(_) => "async_generator_wrapped_value",
                HeapData::AsyncGenAwaitable(a) => a.type_name(),
                HeapData::AIterWrapper(_) => "aiter_wrapper",
                HeapData::CoroutineWrapper(_) => "coroutine_wrapper",
            },
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => "NULL",
        }
    }

    /// Returns the `str` contents if this is a string.
    pub fn as_str<'h>(&self, heap: &'h Heap<impl ResourceTracker>) -> Option<&'h str> {
        match self {
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_str(&self, heap: &Heap<impl ResourceTracker>) -> bool {
        self.as_str(heap).is_some()
    }

    /// Integer view used for indices and counts: ints and bools.
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Truth testing for every built-in type. Never fails.
    pub fn py_bool(&self, heap: &Heap<impl ResourceTracker>) -> bool {
        match self {
            Self::Undefined | Self::None | Self::Pending(_) => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Builtin(_) | Self::ExcClass(_) => true,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => !s.is_empty(),
                HeapData::List(items) | HeapData::Tuple(items) => !items.is_empty(),
                HeapData::Dict(d) => d.len() > 0,
                HeapData::Set(s) => s.len() > 0,
                HeapData::Range(r) => r.len() > 0,
                _ => true,
            },
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => false,
        }
    }

    /// `repr()` of the value.
    pub fn py_repr(&self, heap: &Heap<impl ResourceTracker>) -> String {
        let mut out = String::new();
        let mut seen = Vec::new();
        self.repr_into(&mut out, heap, &mut seen);
        out
    }

    /// `str()` of the value.
    pub fn py_str(&self, heap: &Heap<impl ResourceTracker>) -> String {
        match self {
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => s.clone(),
                HeapData::Exception(e) => e.str_value(heap),
                _ => self.py_repr(heap),
            },
            _ => self.py_repr(heap),
        }
    }

    fn repr_into(&self, out: &mut String, heap: &Heap<impl ResourceTracker>, seen: &mut Vec<HeapId>) {
        match self {
            Self::Undefined => out.push_str("<NULL>"),
            Self::Pending(p) => {
                let _ = write!(out, "<pending {p:?}>");
            }
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => out.push_str(&float_repr(*f)),
            Self::Builtin(b) => b.repr_into(out),
            Self::ExcClass(e) => {
                let _ = write!(out, "<class '{e}'>");
            }
            Self::Ref(id) => {
                if seen.contains(id) {
                    out.push_str(match heap.get(*id) {
                        HeapData::Dict(_) => "{...}",
                        HeapData::List(_) => "[...]",
                        _ => "...",
                    });
                    return;
                }
                seen.push(*id);
                match heap.get(*id) {
                    HeapData::Str(s) => string_repr_into(out, s),
                    HeapData::List(items) => {
                        out.push('[');
                        repr_sequence(out, items, heap, seen);
                        out.push(']');
                    }
                    HeapData::Tuple(items) => {
                        out.push('(');
                        repr_sequence(out, items, heap, seen);
                        if items.len() == 1 {
                            out.push(',');
                        }
                        out.push(')');
                    }
                    HeapData::Dict(d) => {
                        out.push('{');
                        for (i, (k, v)) in d.iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            k.repr_into(out, heap, seen);
                            out.push_str(": ");
                            v.repr_into(out, heap, seen);
                        }
                        out.push('}');
                    }
                    HeapData::Set(s) => {
                        if s.len() == 0 {
                            out.push_str("set()");
                        } else {
                            out.push('{');
                            for (i, v) in s.iter().enumerate() {
                                if i > 0 {
                                    out.push_str(", ");
                                }
                                v.repr_into(out, heap, seen);
                            }
                            out.push('}');
                        }
                    }
                    HeapData::Exception(e) => e.repr_into(out, heap),
                    HeapData::Function(f) => {
                        let _ = write!(out, "<function {} at 0x{:x}>", f.qualname, id.index());
                    }
                    HeapData::Code(c) => {
                        let _ = write!(
                            out,
                            "<code object {} at 0x{:x}, file \"{}\", line {}>",
                            c.code.name,
                            id.index(),
                            c.code.filename,
                            c.code.first_line
                        );
                    }
                    HeapData::Generator(g) => {
                        let _ = write!(out, "<{} object {} at 0x{:x}>", self.type_name(heap), g.qualname, id.index());
                    }
                    HeapData::Module(m) => {
                        let _ = write!(out, "<module '{}'>", m.name);
                    }
                    HeapData::Range(r) => r.repr_into(out),
                    HeapData::Slice(s) => {
                        out.push_str("slice(");
                        s.start.repr_into(out, heap, seen);
                        out.push_str(", ");
                        s.stop.repr_into(out, heap, seen);
                        out.push_str(", ");
                        s.step.repr_into(out, heap, seen);
                        out.push(')');
                    }
                    HeapData::BuiltinMethod(m) => {
                        let _ = write!(
                            out,
                            "<built-in method {} of {} object at 0x{:x}>",
                            m.method,
                            m.receiver.type_name(heap),
                            id.index()
                        );
                    }
                    HeapData::BoundMethod(m) => {
                        out.push_str("<bound method ");
                        if let Some(HeapData::Function(f)) = m.func.ref_id().map(|fid| heap.get(fid)) {
                            out.push_str(&f.qualname);
                        }
                        out.push_str(" of ");
                        m.receiver.repr_into(out, heap, seen);
                        out.push('>');
                    }
                    HeapData::Cell(v) => {
                        if v.is_undefined() {
                            let _ = write!(out, "<cell at 0x{:x}: empty>", id.index());
                        } else {
                            let _ = write!(
                                out,
                                "<cell at 0x{:x}: {} object>",
                                id.index(),
                                v.type_name(heap)
                            );
                        }
                    }
                    _ => {
                        let _ = write!(out, "<{} object at 0x{:x}>", self.type_name(heap), id.index());
                    }
                }
                seen.pop();
            }
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => out.push_str("<Dereferenced>"),
        }
    }

    /// Python `==`. Never fails for built-in types.
    pub fn py_eq(&self, other: &Self, heap: &Heap<impl ResourceTracker>) -> bool {
        match (self, other) {
            (Self::Ref(a), Self::Ref(b)) => {
                if a == b {
                    return true;
                }
                match (heap.get(*a), heap.get(*b)) {
                    (HeapData::Str(x), HeapData::Str(y)) => x == y,
                    (HeapData::List(x), HeapData::List(y)) | (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                        x.len() == y.len() && x.iter().zip(y).all(|(l, r)| l.py_eq(r, heap))
                    }
                    (HeapData::Dict(x), HeapData::Dict(y)) => x.py_eq(y, heap),
                    (HeapData::Set(x), HeapData::Set(y)) => x.py_eq(y),
                    (HeapData::Range(x), HeapData::Range(y)) => x == y,
                    _ => false,
                }
            }
            (Self::Ref(_), _) | (_, Self::Ref(_)) => false,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.eq_num(b),
                _ => self.is_identical(other),
            },
        }
    }

    /// Ordering for `< <= > >=`; `None` when the pair is unorderable.
    pub fn py_partial_cmp(&self, other: &Self, heap: &Heap<impl ResourceTracker>) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.partial_cmp_num(b);
        }
        let (Self::Ref(a), Self::Ref(b)) = (self, other) else {
            return None;
        };
        match (heap.get(*a), heap.get(*b)) {
            (HeapData::Str(x), HeapData::Str(y)) => Some(x.cmp(y)),
            (HeapData::List(x), HeapData::List(y)) | (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                for (l, r) in x.iter().zip(y) {
                    if !l.py_eq(r, heap) {
                        return l.py_partial_cmp(r, heap);
                    }
                }
                Some(x.len().cmp(&y.len()))
            }
            (HeapData::Set(x), HeapData::Set(y)) => x.subset_cmp(y),
            _ => None,
        }
    }

    /// Computes the dict/set key for this value.
    pub fn hash_key(&self, heap: &Heap<impl ResourceTracker>) -> RunResult<HashKey> {
        HashKey::from_value(self, heap)
    }

    pub(crate) fn as_number(&self) -> Option<Number> {
        match self {
            Self::Bool(b) => Some(Number::Int(i64::from(*b))),
            Self::Int(i) => Some(Number::Int(*i)),
            Self::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }
}

/// Numeric view of bool/int/float used by arithmetic and comparison.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn eq_num(self, other: Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }

    fn partial_cmp_num(self, other: Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(&b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

fn repr_sequence(out: &mut String, items: &[Value], heap: &Heap<impl ResourceTracker>, seen: &mut Vec<HeapId>) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.repr_into(out, heap, seen);
    }
}

/// Writes a string literal the way Python's `repr()` does, picking the quote
/// character that avoids escaping when possible.
pub(crate) fn string_repr_into(out: &mut String, s: &str) {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

/// Returns a string representation of a float matching CPython's `repr()`.
pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        // Rust renders `1e16`/`1.5e-5`; Python wants a signed two-digit exponent.
        let raw = format!("{f:e}");
        let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
        let (sign, digits) = match exp.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exp),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    let s = f.to_string();
    if s.contains('.') { s } else { format!("{s}.0") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_repr_matches_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn string_repr_quotes() {
        let mut out = String::new();
        string_repr_into(&mut out, "it's");
        assert_eq!(out, "\"it's\"");
        out.clear();
        string_repr_into(&mut out, "a\nb");
        assert_eq!(out, "'a\\nb'");
    }
}
