//! Builder for emitting wordcode programmatically.
//!
//! `CodeBuilder` records symbolic instructions (labels for jump targets, names
//! for locals and cells) and resolves them in [`CodeBuilder::build`]: it sizes
//! `EXTENDED_ARG` prefixes until jump offsets settle, assembles the line table
//! and computes the maximum stack depth over every control-flow path.

use std::rc::Rc;

use super::{
    code::{Code, CodeFlags, Const},
    op::{CompareOp, Opcode},
};

/// A jump target. Create with [`CodeBuilder::new_label`], place with [`CodeBuilder::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone)]
enum Arg {
    None,
    Imm(u32),
    Label(Label),
    /// Plain local slot, resolved against `varnames` at build time.
    Local(String),
    /// Closure slot, resolved against `cellvars` then `freevars`.
    Cell(String),
}

#[derive(Debug, Clone)]
struct Instr {
    op: Opcode,
    arg: Arg,
    line: u32,
}

/// Builder for one code object.
///
/// # Usage
///
/// ```
/// use pyceval::{CodeBuilder, Opcode};
///
/// let mut b = CodeBuilder::function("add").args(&["a", "b"]);
/// b.load_fast("a");
/// b.load_fast("b");
/// b.emit(Opcode::BinaryAdd);
/// b.emit(Opcode::ReturnValue);
/// let code = b.build();
/// assert_eq!(code.stacksize, 2);
/// ```
#[derive(Debug)]
pub struct CodeBuilder {
    name: String,
    qualname: Option<String>,
    filename: String,
    first_line: u32,
    flags: CodeFlags,
    params: Vec<String>,
    kwonly: Vec<String>,
    varargs: Option<String>,
    varkeywords: Option<String>,
    locals: Vec<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    consts: Vec<Const>,
    names: Vec<String>,
    instrs: Vec<Instr>,
    /// Instruction index each label is bound to.
    labels: Vec<Option<usize>>,
    line: u32,
}

impl CodeBuilder {
    /// Starts a module-level code object (`<module>`), which uses name-based locals.
    #[must_use]
    pub fn module(filename: &str) -> Self {
        Self::new("<module>", filename, CodeFlags::empty())
    }

    /// Starts a function body with optimized locals.
    #[must_use]
    pub fn function(name: &str) -> Self {
        Self::new(name, "<input>", CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS)
    }

    fn new(name: &str, filename: &str, flags: CodeFlags) -> Self {
        Self {
            name: name.to_owned(),
            qualname: None,
            filename: filename.to_owned(),
            first_line: 1,
            flags,
            params: Vec::new(),
            kwonly: Vec::new(),
            varargs: None,
            varkeywords: None,
            locals: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            instrs: Vec::new(),
            labels: Vec::new(),
            line: 1,
        }
    }

    // ------------------------------------------------------------------------
    // Signature
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn qualname(mut self, qualname: &str) -> Self {
        self.qualname = Some(qualname.to_owned());
        self
    }

    #[must_use]
    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = filename.to_owned();
        self
    }

    /// Sets the first line; instructions emitted before any `set_line` use it too.
    #[must_use]
    pub fn first_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self.line = line;
        self
    }

    /// Positional parameters, in order.
    #[must_use]
    pub fn args(mut self, names: &[&str]) -> Self {
        self.params = names.iter().map(|&n| n.to_owned()).collect();
        self
    }

    /// Keyword-only parameters, in order.
    #[must_use]
    pub fn kwonly(mut self, names: &[&str]) -> Self {
        self.kwonly = names.iter().map(|&n| n.to_owned()).collect();
        self
    }

    /// `*name` parameter.
    #[must_use]
    pub fn varargs(mut self, name: &str) -> Self {
        self.varargs = Some(name.to_owned());
        self.flags = self.flags | CodeFlags::VARARGS;
        self
    }

    /// `**name` parameter.
    #[must_use]
    pub fn varkeywords(mut self, name: &str) -> Self {
        self.varkeywords = Some(name.to_owned());
        self.flags = self.flags | CodeFlags::VARKEYWORDS;
        self
    }

    /// Extra plain locals, placed right after the parameters.
    #[must_use]
    pub fn locals(mut self, names: &[&str]) -> Self {
        self.locals = names.iter().map(|&n| n.to_owned()).collect();
        self
    }

    /// Variables of this scope captured by nested scopes.
    #[must_use]
    pub fn cellvars(mut self, names: &[&str]) -> Self {
        self.cellvars = names.iter().map(|&n| n.to_owned()).collect();
        self
    }

    /// Variables captured from enclosing scopes.
    #[must_use]
    pub fn freevars(mut self, names: &[&str]) -> Self {
        self.freevars = names.iter().map(|&n| n.to_owned()).collect();
        self.flags = self.flags | CodeFlags::NESTED;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: CodeFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    #[must_use]
    pub fn generator(self) -> Self {
        self.flags(CodeFlags::GENERATOR)
    }

    #[must_use]
    pub fn coroutine(self) -> Self {
        self.flags(CodeFlags::COROUTINE)
    }

    #[must_use]
    pub fn async_generator(self) -> Self {
        self.flags(CodeFlags::ASYNC_GENERATOR)
    }

    // ------------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------------

    /// Sets the source line attached to subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    fn push(&mut self, op: Opcode, arg: Arg) {
        self.instrs.push(Instr {
            op,
            arg,
            line: self.line,
        });
    }

    /// Emits an instruction without an argument.
    pub fn emit(&mut self, op: Opcode) {
        self.push(op, Arg::None);
    }

    /// Emits an instruction with an immediate argument; wide values get `EXTENDED_ARG` prefixes.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) {
        self.push(op, Arg::Imm(arg));
    }

    /// Emits a jump or block-setup instruction targeting `label`.
    ///
    /// Whether the encoded offset is relative or absolute follows the opcode.
    pub fn emit_jump(&mut self, op: Opcode, label: Label) {
        self.push(op, Arg::Label(label));
    }

    #[must_use]
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    ///
    /// # Panics
    /// Panics if the label was already bound.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.instrs.len());
    }

    /// Index of `c` in the constant pool, adding it if needed.
    pub fn const_index(&mut self, c: Const) -> u32 {
        let existing = self.consts.iter().position(|e| same_const(e, &c));
        let idx = existing.unwrap_or_else(|| {
            self.consts.push(c);
            self.consts.len() - 1
        });
        to_u32(idx)
    }

    /// Index of `name` in the name table, adding it if needed.
    pub fn name_index(&mut self, name: &str) -> u32 {
        let idx = self.names.iter().position(|n| n == name).unwrap_or_else(|| {
            self.names.push(name.to_owned());
            self.names.len() - 1
        });
        to_u32(idx)
    }

    pub fn load_const(&mut self, c: impl Into<Const>) {
        let idx = self.const_index(c.into());
        self.emit_arg(Opcode::LoadConst, idx);
    }

    pub fn load_none(&mut self) {
        self.load_const(Const::None);
    }

    /// Emits `LOAD_CONST code; LOAD_CONST qualname; MAKE_FUNCTION flags`.
    pub fn make_function(&mut self, code: Code, flags: u32) {
        let qualname = code.qualname.clone();
        self.load_const(Const::Code(Rc::new(code)));
        self.load_const(Const::Str(qualname));
        self.emit_arg(Opcode::MakeFunction, flags);
    }

    fn emit_name(&mut self, op: Opcode, name: &str) {
        let idx = self.name_index(name);
        self.emit_arg(op, idx);
    }

    pub fn load_name(&mut self, name: &str) {
        self.emit_name(Opcode::LoadName, name);
    }

    pub fn store_name(&mut self, name: &str) {
        self.emit_name(Opcode::StoreName, name);
    }

    pub fn delete_name(&mut self, name: &str) {
        self.emit_name(Opcode::DeleteName, name);
    }

    pub fn load_global(&mut self, name: &str) {
        self.emit_name(Opcode::LoadGlobal, name);
    }

    pub fn store_global(&mut self, name: &str) {
        self.emit_name(Opcode::StoreGlobal, name);
    }

    pub fn load_attr(&mut self, name: &str) {
        self.emit_name(Opcode::LoadAttr, name);
    }

    pub fn store_attr(&mut self, name: &str) {
        self.emit_name(Opcode::StoreAttr, name);
    }

    pub fn import_name(&mut self, name: &str) {
        self.emit_name(Opcode::ImportName, name);
    }

    pub fn import_from(&mut self, name: &str) {
        self.emit_name(Opcode::ImportFrom, name);
    }

    pub fn load_fast(&mut self, name: &str) {
        self.push(Opcode::LoadFast, Arg::Local(name.to_owned()));
    }

    pub fn store_fast(&mut self, name: &str) {
        self.push(Opcode::StoreFast, Arg::Local(name.to_owned()));
    }

    pub fn delete_fast(&mut self, name: &str) {
        self.push(Opcode::DeleteFast, Arg::Local(name.to_owned()));
    }

    pub fn load_deref(&mut self, name: &str) {
        self.push(Opcode::LoadDeref, Arg::Cell(name.to_owned()));
    }

    pub fn store_deref(&mut self, name: &str) {
        self.push(Opcode::StoreDeref, Arg::Cell(name.to_owned()));
    }

    pub fn delete_deref(&mut self, name: &str) {
        self.push(Opcode::DeleteDeref, Arg::Cell(name.to_owned()));
    }

    pub fn load_closure(&mut self, name: &str) {
        self.push(Opcode::LoadClosure, Arg::Cell(name.to_owned()));
    }

    pub fn compare(&mut self, op: CompareOp) {
        self.emit_arg(Opcode::CompareOp, u32::from(op as u8));
    }

    pub fn call_function(&mut self, argc: u32) {
        self.emit_arg(Opcode::CallFunction, argc);
    }

    pub fn return_value(&mut self) {
        self.emit(Opcode::ReturnValue);
    }

    pub fn pop_top(&mut self) {
        self.emit(Opcode::PopTop);
    }

    // ------------------------------------------------------------------------
    // Assembly
    // ------------------------------------------------------------------------

    /// Resolves labels and names and produces the finished code object.
    ///
    /// # Panics
    /// Panics if a jump targets a label that was never bound, or a closure
    /// instruction names a variable missing from `cellvars`/`freevars`.
    #[must_use]
    pub fn build(self) -> Code {
        let mut varnames: Vec<String> = self.params.clone();
        varnames.extend(self.kwonly.iter().cloned());
        varnames.extend(self.varargs.iter().cloned());
        varnames.extend(self.varkeywords.iter().cloned());
        varnames.extend(self.locals.iter().cloned());
        for instr in &self.instrs {
            if let Arg::Local(name) = &instr.arg
                && !varnames.contains(name)
            {
                varnames.push(name.clone());
            }
        }

        let nparams = self.params.len()
            + self.kwonly.len()
            + usize::from(self.varargs.is_some())
            + usize::from(self.varkeywords.is_some());
        let cell2arg: Vec<Option<u32>> = self
            .cellvars
            .iter()
            .map(|cell| varnames[..nparams].iter().position(|v| v == cell).map(to_u32))
            .collect();

        let cell_index = |name: &str| -> u32 {
            let idx = self
                .cellvars
                .iter()
                .chain(&self.freevars)
                .position(|c| c == name)
                .unwrap_or_else(|| panic!("'{name}' is not a cell or free variable"));
            to_u32(idx)
        };
        let label_target = |label: Label| -> usize {
            self.labels[label.0].unwrap_or_else(|| panic!("label {} never bound", label.0))
        };

        // Resolve everything except jump offsets, which depend on instruction sizes.
        let resolved: Vec<(Opcode, Option<u32>, Option<usize>, u32)> = self
            .instrs
            .iter()
            .map(|instr| {
                let (imm, target) = match &instr.arg {
                    Arg::None => (None, None),
                    Arg::Imm(v) => (Some(*v), None),
                    Arg::Label(l) => (None, Some(label_target(*l))),
                    Arg::Local(name) => (varnames.iter().position(|v| v == name).map(to_u32), None),
                    Arg::Cell(name) => (Some(cell_index(name)), None),
                };
                (instr.op, imm, target, instr.line)
            })
            .collect();

        // Iterate until jump offsets no longer change the size of any instruction.
        let mut sizes: Vec<usize> = resolved
            .iter()
            .map(|(_, imm, _, _)| words_for(imm.unwrap_or(0)))
            .collect();
        let (offsets, args) = loop {
            let mut offsets = Vec::with_capacity(resolved.len() + 1);
            let mut pos = 0;
            for size in &sizes {
                offsets.push(pos);
                pos += size * 2;
            }
            offsets.push(pos);

            let args: Vec<u32> = resolved
                .iter()
                .enumerate()
                .map(|(i, (op, imm, target, _))| match target {
                    Some(t) if op.is_relative_jump() => to_u32(
                        offsets[*t]
                            .checked_sub(offsets[i + 1])
                            .expect("relative jumps only go forward"),
                    ),
                    Some(t) => to_u32(offsets[*t]),
                    None => imm.unwrap_or(0),
                })
                .collect();

            let mut changed = false;
            for (size, arg) in sizes.iter_mut().zip(&args) {
                let needed = words_for(*arg);
                if needed > *size {
                    *size = needed;
                    changed = true;
                }
            }
            if !changed {
                break (offsets, args);
            }
        };

        let mut bytecode = Vec::with_capacity(offsets[offsets.len() - 1]);
        let mut lines: Vec<(u32, u32)> = Vec::new();
        for (i, (op, _, _, line)) in resolved.iter().enumerate() {
            if lines.last().is_none_or(|&(_, l)| l != *line) {
                lines.push((to_u32(offsets[i]), *line));
            }
            let arg = args[i].to_le_bytes();
            for shift in (1..sizes[i]).rev() {
                bytecode.push(Opcode::ExtendedArg as u8);
                bytecode.push(arg[shift]);
            }
            bytecode.push(*op as u8);
            bytecode.push(arg[0]);
        }

        let stacksize = max_stack_depth(&resolved, &args);

        let mut flags = self.flags;
        if self.cellvars.is_empty() && self.freevars.is_empty() {
            flags = flags | CodeFlags::NOFREE;
        }
        Code {
            qualname: self.qualname.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            filename: self.filename,
            first_line: self.first_line,
            argcount: to_u32(self.params.len()),
            kwonlyargcount: to_u32(self.kwonly.len()),
            nlocals: to_u32(varnames.len()),
            stacksize,
            flags,
            bytecode,
            consts: self.consts,
            names: self.names,
            varnames,
            cellvars: self.cellvars,
            freevars: self.freevars,
            cell2arg,
            lines,
        }
    }
}

/// Depth-first walk over every control-flow edge, tracking the deepest stack.
///
/// Each instruction is visited once, with the depth of the first path that reaches
/// it. Back edges through `SETUP_FINALLY` would otherwise raise the depth forever.
fn max_stack_depth(instrs: &[(Opcode, Option<u32>, Option<usize>, u32)], args: &[u32]) -> u32 {
    let mut seen = vec![false; instrs.len()];
    let mut work: Vec<(usize, i32)> = vec![(0, 0)];
    let mut max_depth = 0;
    while let Some((start, depth)) = work.pop() {
        let mut i = start;
        let mut depth = depth;
        while i < instrs.len() {
            if seen[i] {
                break;
            }
            seen[i] = true;
            let (op, _, target, _) = instrs[i];
            if let Some(t) = target {
                let jumped = depth + op.stack_effect(args[i], true);
                max_depth = max_depth.max(jumped);
                work.push((t, jumped));
            }
            depth += op.stack_effect(args[i], false);
            max_depth = max_depth.max(depth);
            if matches!(
                op,
                Opcode::ReturnValue
                    | Opcode::RaiseVarargs
                    | Opcode::JumpForward
                    | Opcode::JumpAbsolute
                    | Opcode::ContinueLoop
                    | Opcode::BreakLoop
            ) {
                break;
            }
            i += 1;
        }
    }
    u32::try_from(max_depth.max(0)).unwrap_or(0)
}

/// Number of code words (instruction plus `EXTENDED_ARG` prefixes) an argument needs.
fn words_for(arg: u32) -> usize {
    match arg {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).expect("code object exceeds u32 range")
}

/// Constant-pool identity: `1`, `True` and `1.0` stay distinct, as do `0.0` and `-0.0`.
fn same_const(a: &Const, b: &Const) -> bool {
    match (a, b) {
        (Const::Float(x), Const::Float(y)) => x.to_bits() == y.to_bits(),
        (Const::Tuple(xs), Const::Tuple(ys)) => xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_const(x, y)),
        (Const::Code(x), Const::Code(y)) => Rc::ptr_eq(x, y),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_emit_basic() {
        let mut b = CodeBuilder::module("<test>");
        b.load_const(1);
        b.store_name("x");
        b.load_none();
        b.return_value();
        let code = b.build();
        assert_eq!(
            code.bytecode,
            vec![
                Opcode::LoadConst as u8,
                0,
                Opcode::StoreName as u8,
                0,
                Opcode::LoadConst as u8,
                1,
                Opcode::ReturnValue as u8,
                0
            ]
        );
        assert_eq!(code.stacksize, 1);
        assert_eq!(code.names, vec!["x".to_owned()]);
    }

    #[test]
    fn relative_and_absolute_jumps() {
        let mut b = CodeBuilder::module("<test>");
        let top = b.new_label();
        let end = b.new_label();
        b.bind(top);
        b.load_name("x");
        b.emit_jump(Opcode::PopJumpIfFalse, end);
        b.emit_jump(Opcode::JumpAbsolute, top);
        b.bind(end);
        b.load_none();
        b.return_value();
        let code = b.build();
        // POP_JUMP_IF_FALSE targets byte 6 absolutely
        assert_eq!(&code.bytecode[2..4], &[Opcode::PopJumpIfFalse as u8, 6]);
        assert_eq!(&code.bytecode[4..6], &[Opcode::JumpAbsolute as u8, 0]);

        let mut b = CodeBuilder::module("<test>");
        let after = b.new_label();
        b.emit_jump(Opcode::SetupLoop, after);
        b.emit(Opcode::PopBlock);
        b.bind(after);
        b.load_none();
        b.return_value();
        let code = b.build();
        assert_eq!(&code.bytecode[0..2], &[Opcode::SetupLoop as u8, 2]);
    }

    #[test]
    fn wide_arguments_get_extended_prefix() {
        let mut b = CodeBuilder::module("<test>");
        for i in 0..300 {
            b.load_const(i64::from(i));
            b.pop_top();
        }
        b.load_none();
        b.return_value();
        let code = b.build();
        let tail = &code.bytecode[code.bytecode.len() - 6..];
        assert_eq!(
            tail,
            &[Opcode::ExtendedArg as u8, 1, Opcode::LoadConst as u8, 44, Opcode::ReturnValue as u8, 0]
        );
    }

    #[test]
    fn handler_depth_counts_exception_triples() {
        let mut b = CodeBuilder::function("f");
        let handler = b.new_label();
        let end = b.new_label();
        b.emit_jump(Opcode::SetupExcept, handler);
        b.emit(Opcode::PopBlock);
        b.emit_jump(Opcode::JumpForward, end);
        b.bind(handler);
        b.pop_top();
        b.pop_top();
        b.pop_top();
        b.emit(Opcode::PopExcept);
        b.bind(end);
        b.load_none();
        b.return_value();
        let code = b.build();
        assert_eq!(code.stacksize, 6);
    }

    #[test]
    fn loop_around_try_finally_terminates() {
        // for i in range(2):
        //     try: pass
        //     finally: pass
        let mut b = CodeBuilder::module("<test>");
        let after = b.new_label();
        let top = b.new_label();
        let exhausted = b.new_label();
        let fin = b.new_label();
        b.emit_jump(Opcode::SetupLoop, after);
        b.load_name("range");
        b.load_const(2);
        b.call_function(1);
        b.emit(Opcode::GetIter);
        b.bind(top);
        b.emit_jump(Opcode::ForIter, exhausted);
        b.store_name("i");
        b.emit_jump(Opcode::SetupFinally, fin);
        b.emit(Opcode::PopBlock);
        b.load_none();
        b.bind(fin);
        b.emit(Opcode::EndFinally);
        b.emit_jump(Opcode::JumpAbsolute, top);
        b.bind(exhausted);
        b.emit(Opcode::PopBlock);
        b.bind(after);
        b.load_none();
        b.return_value();
        let code = b.build();
        assert!(code.stacksize >= 7, "stacksize {}", code.stacksize);
        assert!(code.stacksize < 16, "stacksize {}", code.stacksize);
    }

    #[test]
    fn parameters_order_and_cell2arg() {
        let mut b = CodeBuilder::function("f")
            .args(&["a", "b"])
            .kwonly(&["c"])
            .varargs("rest")
            .varkeywords("kw")
            .cellvars(&["b", "z"]);
        b.load_fast("tmp");
        b.load_deref("z");
        b.emit(Opcode::BinaryAdd);
        b.return_value();
        let code = b.build();
        assert_eq!(code.varnames, vec!["a", "b", "c", "rest", "kw", "tmp"]);
        assert_eq!(code.cell2arg, vec![Some(1), None]);
        assert_eq!(code.total_args(), 5);
        assert_eq!(code.named_args(), 3);
        assert!(code.flags.contains(CodeFlags::VARARGS | CodeFlags::VARKEYWORDS));
    }
}
