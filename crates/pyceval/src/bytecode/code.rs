//! Code objects.
//!
//! [`Code`] is the immutable, serializable description of one compiled scope:
//! its wordcode, constant pool, name tables and arity. [`CodeObject`] is the
//! heap-resident view of a `Code` whose constants have been materialized into
//! runtime values once, so `LOAD_CONST` is a refcount bump.

use std::{fmt, rc::Rc};

use serde::{Deserialize, Serialize};

use super::op::{HAVE_ARGUMENT, Opcode};
use crate::{
    exception_private::RunResult,
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Code flags, bit-compatible with `co_flags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeFlags(u32);

impl CodeFlags {
    pub const OPTIMIZED: Self = Self(0x0001);
    pub const NEWLOCALS: Self = Self(0x0002);
    pub const VARARGS: Self = Self(0x0004);
    pub const VARKEYWORDS: Self = Self(0x0008);
    pub const NESTED: Self = Self(0x0010);
    pub const GENERATOR: Self = Self(0x0020);
    pub const NOFREE: Self = Self(0x0040);
    pub const COROUTINE: Self = Self(0x0080);
    pub const ITERABLE_COROUTINE: Self = Self(0x0100);
    pub const ASYNC_GENERATOR: Self = Self(0x0200);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True for any of the three resumable flavors.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        self.0 & (Self::GENERATOR.0 | Self::COROUTINE.0 | Self::ASYNC_GENERATOR.0) != 0
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A compile-time constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Const>),
    Code(Rc<Code>),
}

impl From<&str> for Const {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<i64> for Const {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => f.write_str(&crate::value::float_repr(*x)),
            Self::Str(s) => {
                let mut out = String::new();
                crate::value::string_repr_into(&mut out, s);
                f.write_str(&out)
            }
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Code(code) => write!(f, "<code object {}>", code.name),
        }
    }
}

/// One compiled scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub first_line: u32,
    pub argcount: u32,
    pub kwonlyargcount: u32,
    /// Number of plain local slots (`varnames.len()`).
    pub nlocals: u32,
    /// Maximum operand stack depth.
    pub stacksize: u32,
    pub flags: CodeFlags,
    /// Wordcode: `(opcode, arg)` byte pairs.
    pub bytecode: Vec<u8>,
    pub consts: Vec<Const>,
    pub names: Vec<String>,
    /// Parameter names first (positional, keyword-only, `*args`, `**kwargs`), then other locals.
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    /// For each cell variable, the parameter slot it shadows, if any.
    pub cell2arg: Vec<Option<u32>>,
    /// `(instruction offset, line)` pairs sorted by offset; each entry holds until the next.
    pub lines: Vec<(u32, u32)>,
}

impl Code {
    /// Source line for the instruction at `offset`.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> u32 {
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        let idx = self.lines.partition_point(|&(start, _)| start <= offset);
        if idx == 0 {
            self.first_line
        } else {
            self.lines[idx - 1].1
        }
    }

    /// Total number of positional and keyword-only parameters, including `*args`/`**kwargs`.
    #[must_use]
    pub fn total_args(&self) -> usize {
        (self.argcount
            + self.kwonlyargcount
            + u32::from(self.flags.contains(CodeFlags::VARARGS))
            + u32::from(self.flags.contains(CodeFlags::VARKEYWORDS))) as usize
    }

    /// Parameters that can be bound by keyword: positional plus keyword-only.
    ///
    /// The `*args` tuple lives right after them in the fast locals, then the `**kwargs` dict.
    #[must_use]
    pub fn named_args(&self) -> usize {
        (self.argcount + self.kwonlyargcount) as usize
    }

    /// Number of closure slots: cell variables followed by free variables.
    #[must_use]
    pub fn ncells(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    /// Name of closure slot `index`, used in unbound-variable messages.
    #[must_use]
    pub fn cell_name(&self, index: usize) -> &str {
        if index < self.cellvars.len() {
            &self.cellvars[index]
        } else {
            self.freevars.get(index - self.cellvars.len()).map_or("?", String::as_str)
        }
    }

    /// Opcode at an instruction offset, if the offset is in range and valid.
    #[must_use]
    pub fn opcode_at(&self, offset: usize) -> Option<Opcode> {
        self.bytecode.get(offset).and_then(|&b| Opcode::try_from(b).ok())
    }

    /// Checks that every table index and jump target in the bytecode is in range,
    /// recursing into nested code constants.
    ///
    /// Code that passes can be evaluated without out-of-bounds slot access.
    pub fn validate(&self) -> Result<(), String> {
        let nlocals = self.nlocals as usize;
        if self.varnames.len() < nlocals {
            return Err(format!("{}: nlocals {nlocals} exceeds {} varnames", self.name, self.varnames.len()));
        }
        if nlocals < self.total_args() {
            return Err(format!("{}: {} parameters but only {nlocals} locals", self.name, self.total_args()));
        }
        if self.cell2arg.len() > self.cellvars.len() {
            return Err(format!("{}: cell2arg is longer than cellvars", self.name));
        }
        if let Some(arg) = self.cell2arg.iter().flatten().find(|&&arg| arg as usize >= nlocals) {
            return Err(format!("{}: cell2arg slot {arg} out of range", self.name));
        }
        let mut ext: u32 = 0;
        for (offset, pair) in self.bytecode.chunks_exact(2).enumerate() {
            let offset = offset * 2;
            let arg = ext | u32::from(pair[1]);
            let Ok(op) = Opcode::try_from(pair[0]) else {
                ext = 0;
                continue;
            };
            if op == Opcode::ExtendedArg {
                ext = arg << 8;
                continue;
            }
            ext = 0;
            let idx = arg as usize;
            let limit = match op {
                Opcode::LoadConst => self.consts.len(),
                Opcode::LoadName
                | Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::DeleteGlobal
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::ImportName
                | Opcode::ImportFrom
                | Opcode::StoreAnnotation => self.names.len(),
                Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => nlocals,
                Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref | Opcode::DeleteDeref | Opcode::LoadClassderef => {
                    self.ncells()
                }
                op if op.is_relative_jump() => {
                    if offset + 2 + idx > self.bytecode.len() {
                        return Err(format!("{}: {op} at {offset} jumps past the end", self.name));
                    }
                    continue;
                }
                op if op.is_absolute_jump() => {
                    if idx > self.bytecode.len() {
                        return Err(format!("{}: {op} at {offset} jumps past the end", self.name));
                    }
                    continue;
                }
                _ => continue,
            };
            if idx >= limit {
                return Err(format!("{}: {op} at {offset} has argument {idx} out of range", self.name));
            }
        }
        for c in &self.consts {
            if let Const::Code(code) = c {
                code.validate()?;
            }
        }
        Ok(())
    }

    /// Serializes this code object with postcard.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserializes a code object produced by [`Code::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Human-readable listing in the style of `dis.dis`, nested code objects included.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out);
        out
    }

    fn disassemble_into(&self, out: &mut String) {
        use fmt::Write;

        let _ = writeln!(out, "Disassembly of <code object {}, file \"{}\", line {}>:", self.name, self.filename, self.first_line);
        let mut last_line = None;
        let mut ext: u32 = 0;
        for (offset, pair) in self.bytecode.chunks_exact(2).enumerate() {
            let offset = offset * 2;
            let line = self.line_for(offset);
            let line_col = if last_line == Some(line) {
                String::new()
            } else {
                last_line = Some(line);
                line.to_string()
            };
            let arg = ext | u32::from(pair[1]);
            let Ok(op) = Opcode::try_from(pair[0]) else {
                let _ = writeln!(out, "{line_col:>4} {offset:>6} <{}>", pair[0]);
                ext = 0;
                continue;
            };
            if op == Opcode::ExtendedArg {
                ext = arg << 8;
            } else {
                ext = 0;
            }
            if pair[0] < HAVE_ARGUMENT {
                let _ = writeln!(out, "{line_col:>4} {offset:>6} {op}");
                continue;
            }
            let detail = self.describe_arg(op, arg, offset);
            let _ = writeln!(out, "{line_col:>4} {offset:>6} {op:<24} {arg:>4}{detail}");
        }
        for c in &self.consts {
            if let Const::Code(inner) = c {
                out.push('\n');
                inner.disassemble_into(out);
            }
        }
    }

    fn describe_arg(&self, op: Opcode, arg: u32, offset: usize) -> String {
        let idx = arg as usize;
        let named = |table: &[String]| table.get(idx).map(|n| format!(" ({n})")).unwrap_or_default();
        match op {
            Opcode::LoadConst => self.consts.get(idx).map(|c| format!(" ({c})")).unwrap_or_default(),
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::ImportName
            | Opcode::ImportFrom
            | Opcode::StoreAnnotation => named(&self.names),
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => named(&self.varnames),
            Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref | Opcode::DeleteDeref | Opcode::LoadClassderef => {
                format!(" ({})", self.cell_name(idx))
            }
            Opcode::CompareOp => super::op::CompareOp::from_repr(pair_arg(arg))
                .map(|c| format!(" ({})", c.symbol()))
                .unwrap_or_default(),
            op if op.is_relative_jump() => format!(" (to {})", offset + 2 + idx),
            _ => String::new(),
        }
    }
}

fn pair_arg(arg: u32) -> u8 {
    u8::try_from(arg).unwrap_or(u8::MAX)
}

/// Heap-resident code object: the shared `Code` plus its materialized constants.
#[derive(Debug)]
pub(crate) struct CodeObject {
    pub code: Rc<Code>,
    pub consts: Vec<Value>,
}

impl CodeObject {
    /// Allocates a code object, materializing its constants (nested code included).
    pub fn allocate(code: Rc<Code>, heap: &mut Heap<impl ResourceTracker>) -> RunResult<HeapId> {
        let mut consts = Vec::with_capacity(code.consts.len());
        for c in &code.consts {
            match const_to_value(c, heap) {
                Ok(v) => consts.push(v),
                Err(e) => {
                    consts.drop_with_heap(heap);
                    return Err(e);
                }
            }
        }
        Ok(heap.allocate(HeapData::Code(Self { code, consts }))?)
    }
}

fn const_to_value(c: &Const, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Value> {
    Ok(match c {
        Const::None => Value::None,
        Const::Bool(b) => Value::Bool(*b),
        Const::Int(i) => Value::Int(*i),
        Const::Float(f) => Value::Float(*f),
        Const::Str(s) => heap.alloc_str(s.as_str())?,
        Const::Tuple(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match const_to_value(item, heap) {
                    Ok(v) => values.push(v),
                    Err(e) => {
                        values.drop_with_heap(heap);
                        return Err(e);
                    }
                }
            }
            heap.alloc_tuple(values)?
        }
        Const::Code(code) => Value::Ref(CodeObject::allocate(Rc::clone(code), heap)?),
    })
}

impl<T: ResourceTracker> DropWithHeap<T> for CodeObject {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.consts.drop_with_heap(heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Code {
        Code {
            name: "f".into(),
            qualname: "f".into(),
            filename: "<test>".into(),
            first_line: 1,
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            bytecode: vec![Opcode::LoadConst as u8, 0, Opcode::ReturnValue as u8, 0],
            consts: vec![Const::None],
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            cell2arg: Vec::new(),
            lines: vec![(0, 3), (2, 4)],
        }
    }

    #[test]
    fn line_table_lookup() {
        let code = sample();
        assert_eq!(code.line_for(0), 3);
        assert_eq!(code.line_for(2), 4);
        assert_eq!(code.line_for(40), 4);
    }

    #[test]
    fn validate_checks_operands_and_nested_code() {
        assert_eq!(sample().validate(), Ok(()));

        let mut bad_const = sample();
        bad_const.bytecode[1] = 1;
        assert!(bad_const.validate().unwrap_err().contains("LOAD_CONST"));

        let mut bad_jump = sample();
        bad_jump.bytecode = vec![Opcode::JumpAbsolute as u8, 8, Opcode::ReturnValue as u8, 0];
        assert!(bad_jump.validate().unwrap_err().contains("past the end"));

        let mut bad_cell = sample();
        bad_cell.cellvars = vec!["x".into()];
        bad_cell.cell2arg = vec![Some(0)];
        assert!(bad_cell.validate().is_err());

        let mut outer = sample();
        outer.consts.push(Const::Code(Rc::new(bad_const)));
        assert!(outer.validate().unwrap_err().starts_with("f: LOAD_CONST"));
    }

    #[test]
    fn postcard_round_trip_keeps_nested_code() {
        let mut outer = sample();
        outer.consts.push(Const::Code(Rc::new(sample())));
        let bytes = outer.to_bytes().unwrap();
        assert_eq!(Code::from_bytes(&bytes).unwrap(), outer);
    }

    #[test]
    fn disassembly_names_operands() {
        let text = sample().disassemble();
        assert!(text.contains("LOAD_CONST"), "{text}");
        assert!(text.contains("(None)"), "{text}");
        assert!(text.contains("RETURN_VALUE"), "{text}");
    }
}
