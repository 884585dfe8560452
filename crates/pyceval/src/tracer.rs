//! Execution tracing for the evaluation loop.
//!
//! The loop is generic over a [`VmTracer`]; with [`NoopTracer`] every hook is an
//! empty inlined default and compiles away, the same way
//! [`NoLimitTracker`](crate::resource::NoLimitTracker) removes resource accounting.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency counters and call depth tracking |
//! | [`CoverageTracer`] | Instruction offsets executed per code object |
//! | [`RecordingTracer`] | Full event recording for post-mortem analysis |
//!
//! ```ignore
//! let mut tracer = ProfilingTracer::new();
//! runner.run(NoLimitTracker, &mut StdPrint, &mut tracer, None)?;
//! println!("{}", tracer.report());
//! ```

use std::collections::HashMap;

use crate::{bytecode::Opcode, exception_private::ExcType};

/// Trace event recorded by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An instruction was dispatched.
    Instruction {
        /// Byte offset of the instruction in its code object.
        ip: usize,
        opcode: Opcode,
        /// Operand stack depth before the instruction ran.
        stack_depth: usize,
    },
    /// A frame started evaluating.
    Call { func_name: String, depth: usize },
    /// A frame stopped evaluating (returned, raised or yielded).
    Return { depth: usize },
    /// An exception started propagating out of an instruction.
    Exception { exc_type: ExcType, depth: usize },
    /// `SETUP_*` or the unwinder pushed a block; `depth` is the block stack depth after the push.
    BlockPush { kind: &'static str, depth: usize },
    /// A block was popped; `depth` is the block stack depth after the pop.
    BlockPop { kind: &'static str, depth: usize },
    /// The unwinder transferred control to a handler.
    Unwind { reason: &'static str, target: usize },
    /// A generator, coroutine or async generator frame suspended.
    Yield { depth: usize },
    /// A suspended frame was resumed.
    Resume { func_name: String, depth: usize },
    /// The eval breaker was serviced.
    Breaker,
}

/// Hooks called by the evaluation loop.
///
/// All methods default to no-ops so implementations only override what they need.
pub trait VmTracer: std::fmt::Debug {
    /// Called before each instruction. This is the hottest hook.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called when a fresh frame starts; `depth` counts active frames including it.
    #[inline(always)]
    fn on_call(&mut self, _func_name: &str, _depth: usize) {}

    /// Called when a frame stops evaluating; `depth` counts the frames still active.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when an instruction fails and the exception enters the unwinder.
    #[inline(always)]
    fn on_exception(&mut self, _exc_type: ExcType, _depth: usize) {}

    #[inline(always)]
    fn on_block_push(&mut self, _kind: &'static str, _depth: usize) {}

    #[inline(always)]
    fn on_block_pop(&mut self, _kind: &'static str, _depth: usize) {}

    /// Called when unwinding for `reason` stops at a handler starting at `target`.
    #[inline(always)]
    fn on_unwind(&mut self, _reason: &'static str, _target: usize) {}

    /// Called when a resumable frame suspends.
    #[inline(always)]
    fn on_yield(&mut self, _depth: usize) {}

    /// Called when a suspended frame resumes; `depth` counts active frames including it.
    #[inline(always)]
    fn on_resume(&mut self, _func_name: &str, _depth: usize) {}

    /// Called when the loop services a raised eval-breaker flag.
    #[inline(always)]
    fn on_breaker(&mut self) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Tracer that prints a human-readable execution log to stderr.
///
/// ```text
/// [    0] LOAD_CONST            stack=0  frames=1
/// [    2] STORE_NAME            stack=1  frames=1
///   >>> CALL f                  depth=2
/// [    0] LOAD_FAST             stack=0  frames=2
///   <<< RETURN                  depth=1
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Stop after this many instructions; `None` means unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that goes quiet after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[{ip:>5}] {opcode:<20}  stack={stack_depth}  frames={frame_depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_call(&mut self, func_name: &str, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> CALL {func_name:<20} depth={depth}");
        }
    }

    fn on_return(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< RETURN                  depth={depth}");
        }
    }

    fn on_yield(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< YIELD                   depth={depth}");
        }
    }

    fn on_resume(&mut self, func_name: &str, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> RESUME {func_name:<18} depth={depth}");
        }
    }

    fn on_exception(&mut self, exc_type: ExcType, depth: usize) {
        if !self.stopped {
            eprintln!("  !!! RAISE {exc_type:<19} depth={depth}");
        }
    }

    fn on_unwind(&mut self, reason: &'static str, target: usize) {
        if !self.stopped {
            eprintln!("  ~~~ UNWIND {reason:<18} to={target}");
        }
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

/// Tracer that counts opcodes, calls and handler entries.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: HashMap<Opcode, u64>,
    total_instructions: u64,
    max_depth: usize,
    total_calls: u64,
    total_resumes: u64,
    total_yields: u64,
    total_exceptions: u64,
    total_handlers: u64,
    total_breaker_checks: u64,
}

/// Summary produced by [`ProfilingTracer::report`].
#[derive(Debug)]
pub struct ProfilingReport {
    /// Per-opcode execution counts, most frequent first.
    pub opcode_counts: Vec<(Opcode, u64)>,
    pub total_instructions: u64,
    pub max_depth: usize,
    /// Fresh frames started.
    pub total_calls: u64,
    /// Suspended frames resumed.
    pub total_resumes: u64,
    pub total_yields: u64,
    /// Exceptions raised by instructions, counted once per frame they unwind through.
    pub total_exceptions: u64,
    /// Handlers (`except`, `finally`, loop exits) the unwinder jumped to.
    pub total_handlers: u64,
    pub total_breaker_checks: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));
        ProfilingReport {
            opcode_counts,
            total_instructions: self.total_instructions,
            max_depth: self.max_depth,
            total_calls: self.total_calls,
            total_resumes: self.total_resumes,
            total_yields: self.total_yields,
            total_exceptions: self.total_exceptions,
            total_handlers: self.total_handlers,
            total_breaker_checks: self.total_breaker_checks,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
    }

    #[inline]
    fn on_call(&mut self, _func_name: &str, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_yield(&mut self, _depth: usize) {
        self.total_yields += 1;
    }

    fn on_resume(&mut self, _func_name: &str, depth: usize) {
        self.total_resumes += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_exception(&mut self, _exc_type: ExcType, _depth: usize) {
        self.total_exceptions += 1;
    }

    fn on_unwind(&mut self, _reason: &'static str, _target: usize) {
        self.total_handlers += 1;
    }

    fn on_breaker(&mut self) {
        self.total_breaker_checks += 1;
    }
}

impl std::fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== VM Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Max call depth:     {}", self.max_depth)?;
        writeln!(f, "Resumes:            {}", self.total_resumes)?;
        writeln!(f, "Yields:             {}", self.total_yields)?;
        writeln!(f, "Exceptions:         {}", self.total_exceptions)?;
        writeln!(f, "Handlers entered:   {}", self.total_handlers)?;
        writeln!(f, "Breaker services:   {}", self.total_breaker_checks)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions as f64) * 100.0;
            writeln!(f, "  {opcode:<24} {count:>10}  ({pct:>5.1}%)")?;
        }
        Ok(())
    }
}

// ============================================================================
// CoverageTracer
// ============================================================================

/// Records which instruction offsets ran, keyed by the name of the frame's code.
///
/// Offsets are only unique within one code object, so coverage is grouped by
/// the name reported through [`VmTracer::on_call`].
#[derive(Debug, Default)]
pub struct CoverageTracer {
    /// Names of the frames currently running, innermost last.
    active: Vec<String>,
    offsets: ahash::AHashMap<String, ahash::AHashSet<usize>>,
}

impl CoverageTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets executed in code objects named `name`.
    #[must_use]
    pub fn covered(&self, name: &str) -> Option<&ahash::AHashSet<usize>> {
        self.offsets.get(name)
    }

    /// Total number of distinct (code name, offset) pairs executed.
    #[must_use]
    pub fn coverage_count(&self) -> usize {
        self.offsets.values().map(|offsets| offsets.len()).sum()
    }
}

impl VmTracer for CoverageTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        if let Some(name) = self.active.last() {
            if let Some(set) = self.offsets.get_mut(name) {
                set.insert(ip);
            } else {
                self.offsets.entry(name.clone()).or_default().insert(ip);
            }
        }
    }

    fn on_call(&mut self, func_name: &str, _depth: usize) {
        self.active.push(func_name.to_owned());
    }

    fn on_resume(&mut self, func_name: &str, _depth: usize) {
        self.active.push(func_name.to_owned());
    }

    fn on_return(&mut self, _depth: usize) {
        self.active.pop();
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Records every event, optionally up to a limit.
///
/// The most expensive tracer (allocates per event); meant for short runs and
/// for comparing the event streams of two executions.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_none_or(|l| self.events.len() < l) {
            self.events.push(event);
        }
    }
}

impl VmTracer for RecordingTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        self.record(TraceEvent::Instruction {
            ip,
            opcode,
            stack_depth,
        });
    }

    fn on_call(&mut self, func_name: &str, depth: usize) {
        self.record(TraceEvent::Call {
            func_name: func_name.to_owned(),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_yield(&mut self, depth: usize) {
        self.record(TraceEvent::Yield { depth });
    }

    fn on_exception(&mut self, exc_type: ExcType, depth: usize) {
        self.record(TraceEvent::Exception { exc_type, depth });
    }

    fn on_block_push(&mut self, kind: &'static str, depth: usize) {
        self.record(TraceEvent::BlockPush { kind, depth });
    }

    fn on_block_pop(&mut self, kind: &'static str, depth: usize) {
        self.record(TraceEvent::BlockPop { kind, depth });
    }

    fn on_unwind(&mut self, reason: &'static str, target: usize) {
        self.record(TraceEvent::Unwind { reason, target });
    }

    fn on_resume(&mut self, func_name: &str, depth: usize) {
        self.record(TraceEvent::Resume {
            func_name: func_name.to_owned(),
            depth,
        });
    }

    fn on_breaker(&mut self) {
        self.record(TraceEvent::Breaker);
    }
}
