//! Activation records: operand stack, fast locals, closure cells and the block stack.

use std::{cell::Cell, rc::Rc};

use smallvec::SmallVec;

use crate::{
    bytecode::Code,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Read in place of a missing operand.
static UNDEFINED: Value = Value::Undefined;

/// Maximum number of nested blocks in a single frame.
pub(crate) const MAX_BLOCKS: usize = 20;

/// Kind of an entry on a frame's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    /// `SETUP_LOOP`: `break` jumps to the handler, `continue` stops here.
    Loop,
    /// `SETUP_EXCEPT`: catches exceptions only.
    Except,
    /// `SETUP_FINALLY`, `SETUP_WITH`, `SETUP_ASYNC_WITH`: runs on every exit.
    Finally,
    /// Pushed when a handler is entered; owns the saved exception triple.
    ExceptHandler,
}

/// One block: where to jump and the stack depth to restore when it unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub kind: BlockKind,
    pub handler: usize,
    pub level: usize,
}

/// Non-exception reason for entering a `finally` clause.
///
/// The unwinder pushes it as `Value::Pending` (with the return value or the
/// `continue` target below it for `Return`/`Continue`); `END_FINALLY` pops it
/// and resumes the unwind. `Silenced` is pushed by `WITH_CLEANUP_FINISH` when
/// `__exit__` swallowed the exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingUnwind {
    Return,
    Continue,
    Break,
    Silenced,
}

/// How a frame stopped running.
#[derive(Debug)]
pub(crate) enum FrameExit {
    /// The frame finished; it cannot be resumed.
    Return(Value),
    /// The frame suspended at a yield and can be resumed.
    Yield(Value),
}

/// An `(exc_type, exc_value, exc_traceback)` triple.
///
/// Used for the thread-wide "exception being handled" and for the copy a
/// generator keeps while it is suspended. `Undefined` in every slot means unset.
#[derive(Debug)]
pub(crate) struct ExcInfo {
    pub exc_type: Value,
    pub value: Value,
    pub traceback: Value,
}

impl ExcInfo {
    pub fn empty() -> Self {
        Self {
            exc_type: Value::Undefined,
            value: Value::Undefined,
            traceback: Value::Undefined,
        }
    }

    /// True when the triple names an actual exception (not unset, not `None`).
    pub fn is_active(&self) -> bool {
        !self.exc_type.is_undefined() && !self.exc_type.is_none()
    }

    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::empty())
    }

    pub fn clone_with_heap(&self, heap: &mut Heap<impl ResourceTracker>) -> Self {
        Self {
            exc_type: self.exc_type.clone_with_heap(heap),
            value: self.value.clone_with_heap(heap),
            traceback: self.traceback.clone_with_heap(heap),
        }
    }

    /// Values as they are read by Python code: unset slots become `None`.
    pub fn to_python(&self, heap: &mut Heap<impl ResourceTracker>) -> [Value; 3] {
        [&self.exc_type, &self.value, &self.traceback].map(|v| {
            if v.is_undefined() {
                Value::None
            } else {
                v.clone_with_heap(heap)
            }
        })
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ExcInfo {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.exc_type.drop_with_heap(heap);
        self.value.drop_with_heap(heap);
        self.traceback.drop_with_heap(heap);
    }
}

/// A single activation of a code object.
///
/// Frames of ordinary calls live on the Rust stack for the duration of the call;
/// generator frames are boxed inside their generator object between resumptions.
/// A frame holds no link to its caller.
#[derive(Debug)]
pub(crate) struct Frame {
    pub code: Rc<Code>,
    /// Owned reference to the heap code object, which holds the materialized constants.
    pub code_id: HeapId,
    /// Offset of the next instruction.
    pub ip: usize,
    /// Offset of the instruction currently (or last) executed.
    pub lasti: usize,
    /// Set once execution has begun; a generator that was never resumed is unstarted.
    pub started: bool,
    pub stack: Vec<Value>,
    /// Fast locals, `Undefined` when unbound.
    pub locals: Vec<Value>,
    /// Cell variables followed by free variables.
    pub cells: Vec<HeapId>,
    /// Inline up to eight blocks before spilling.
    pub blocks: SmallVec<[Block; 8]>,
    pub globals: HeapId,
    pub builtins: HeapId,
    /// Name-based locals for module and class-body code.
    pub locals_dict: Option<HeapId>,
    /// Exception state a generator keeps aside while suspended.
    pub exc_state: ExcInfo,
    /// Set when an instruction reads below the bottom of the operand stack.
    pub underflow: Cell<bool>,
}

impl Frame {
    /// Creates an unstarted frame. Every id passed in is an owned reference.
    pub fn new(
        code: Rc<Code>,
        code_id: HeapId,
        globals: HeapId,
        builtins: HeapId,
        locals_dict: Option<HeapId>,
    ) -> Self {
        let nlocals = code.nlocals as usize;
        let mut locals = Vec::with_capacity(nlocals);
        locals.resize_with(nlocals, || Value::Undefined);
        Self {
            stack: Vec::with_capacity(code.stacksize as usize),
            cells: Vec::with_capacity(code.ncells()),
            code,
            code_id,
            ip: 0,
            lasti: 0,
            started: false,
            locals,
            blocks: SmallVec::new(),
            globals,
            builtins,
            locals_dict,
            exc_state: ExcInfo::empty(),
            underflow: Cell::new(false),
        }
    }

    // ========================================================================
    // Operand stack
    // ========================================================================

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Index of the n-th value from the top (1-based), flagging underflow when absent.
    fn slot(&self, n: usize) -> Option<usize> {
        let idx = self.stack.len().checked_sub(n);
        if idx.is_none() || n == 0 {
            self.underflow.set(true);
            return None;
        }
        idx
    }

    /// Pops the top value; `Undefined` on an empty stack.
    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_else(|| {
            self.underflow.set(true);
            Value::Undefined
        })
    }

    #[inline]
    pub fn top(&self) -> &Value {
        self.peek(1)
    }

    /// `PEEK(n)`: the n-th value from the top, 1-based.
    #[inline]
    pub fn peek(&self, n: usize) -> &Value {
        match self.slot(n) {
            Some(idx) => &self.stack[idx],
            None => &UNDEFINED,
        }
    }

    /// Replaces the value `n` slots from the top (1-based), returning the old one.
    ///
    /// On underflow `value` itself is handed back.
    #[inline]
    pub fn replace(&mut self, n: usize, value: Value) -> Value {
        match self.slot(n) {
            Some(idx) => std::mem::replace(&mut self.stack[idx], value),
            None => value,
        }
    }

    /// Pops the top `n` values, preserving their order.
    ///
    /// Missing values at the bottom are filled with `Undefined`.
    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let Some(start) = self.stack.len().checked_sub(n) else {
            self.underflow.set(true);
            let mut values: Vec<Value> = Vec::with_capacity(n);
            values.resize_with(n - self.stack.len(), || Value::Undefined);
            values.append(&mut self.stack);
            return values;
        };
        self.stack.split_off(start)
    }

    /// `ROT_TWO`/`ROT_THREE`: moves the top value down `n - 1` places.
    pub fn rotate(&mut self, n: usize) {
        if let Some(start) = self.slot(n) {
            self.stack[start..].rotate_right(1);
        }
    }

    /// Releases stack values above `level`.
    pub fn unwind_stack(&mut self, level: usize, heap: &mut Heap<impl ResourceTracker>) {
        while self.stack.len() > level {
            self.pop().drop_with_heap(heap);
        }
    }

    // ========================================================================
    // Block stack
    // ========================================================================

    /// Pushes a block whose level is the current stack depth.
    pub fn push_block(&mut self, kind: BlockKind, handler: usize) -> RunResult<()> {
        if self.blocks.len() >= MAX_BLOCKS {
            return Err(ExcType::system_error("XXX block stack overflow"));
        }
        self.blocks.push(Block {
            kind,
            handler,
            level: self.stack.len(),
        });
        Ok(())
    }

    pub fn pop_block(&mut self) -> RunResult<Block> {
        self.blocks
            .pop()
            .ok_or_else(|| ExcType::system_error("XXX block stack underflow"))
    }

    /// True if any `ExceptHandler` block is active, i.e. the frame is inside an
    /// `except` or `finally` clause that is handling an exception.
    pub fn in_handler(&self) -> bool {
        self.blocks.iter().any(|b| b.kind == BlockKind::ExceptHandler)
    }

    /// Source line of the current instruction.
    pub fn line(&self) -> u32 {
        self.code.line_for(self.lasti)
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Frame {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.stack.drop_with_heap(heap);
        self.locals.drop_with_heap(heap);
        self.cells.drop_with_heap(heap);
        heap.dec_ref(self.code_id);
        heap.dec_ref(self.globals);
        heap.dec_ref(self.builtins);
        self.locals_dict.drop_with_heap(heap);
        self.exc_state.drop_with_heap(heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::{CodeBuilder, CodeObject},
        heap::HeapData,
        resource::NoLimitTracker,
        types::Dict,
    };

    fn frame(heap: &mut Heap<NoLimitTracker>) -> Frame {
        let code = Rc::new(CodeBuilder::function("f").locals(&["x"]).build());
        let code_id = CodeObject::allocate(Rc::clone(&code), heap).unwrap();
        let globals = heap.allocate(HeapData::Dict(Dict::new())).unwrap();
        let builtins = heap.allocate(HeapData::Dict(Dict::new())).unwrap();
        Frame::new(code, code_id, globals, builtins, None)
    }

    #[test]
    fn unwind_stack_releases_values_above_level() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let mut f = frame(&mut heap);
        f.push(Value::Int(1));
        f.push_block(BlockKind::Except, 10).unwrap();
        let s = heap.alloc_str("temp").unwrap();
        f.push(s);
        let list = heap.alloc_list(Vec::new()).unwrap();
        f.push(list);
        let block = f.pop_block().unwrap();
        assert_eq!(block.level, 1);
        f.unwind_stack(block.level, &mut heap);
        assert_eq!(f.stack.len(), 1);
        assert_eq!(heap.heap_stats().objects_by_type.get("Str"), None);
        f.drop_with_heap(&mut heap);
        assert_eq!(heap.heap_stats().live_objects, 0);
    }

    #[test]
    fn reading_below_the_stack_flags_underflow() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let mut f = frame(&mut heap);
        f.push(Value::Int(1));
        f.rotate(2);
        assert!(f.underflow.take());
        assert!(matches!(f.peek(1), Value::Int(1)));
        assert!(!f.underflow.get());

        let values = f.pop_n(3);
        assert!(f.underflow.take());
        assert_eq!(values.len(), 3);
        assert!(values[0].is_undefined() && values[1].is_undefined());
        assert!(matches!(values[2], Value::Int(1)));

        assert!(f.pop().is_undefined());
        assert!(f.top().is_undefined());
        assert!(f.underflow.get());
        f.drop_with_heap(&mut heap);
    }

    #[test]
    fn block_stack_overflow_is_system_error() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let mut f = frame(&mut heap);
        for _ in 0..MAX_BLOCKS {
            f.push_block(BlockKind::Loop, 0).unwrap();
        }
        let err = f.push_block(BlockKind::Loop, 0).unwrap_err();
        assert_eq!(err.exc_type(&heap), Some(ExcType::SystemError));
        err.drop_with_heap(&mut heap);
        f.drop_with_heap(&mut heap);
    }
}
