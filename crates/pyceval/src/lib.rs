#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors CPython")]
#![expect(clippy::unnecessary_wraps, reason = "dispatch signatures are uniform")]
#![expect(clippy::needless_pass_by_value, reason = "call APIs pass values consistently")]
#![expect(clippy::too_many_arguments, reason = "frame setup threads many pieces of state")]
mod breaker;
mod builtins;
mod bytecode;
mod exception_private;
mod exception_public;
mod format;
mod heap;
mod import;
mod io;
mod object;
mod ops;
mod resource;
mod run;
pub mod tracer;
mod types;
mod value;

#[cfg(feature = "ref-count-return")]
pub use crate::run::RefCountOutput;
pub use crate::{
    breaker::{EvalBreaker, PendingCall},
    bytecode::{Code, CodeBuilder, CodeFlags, CompareOp, Const, HAVE_ARGUMENT, Label, Opcode, make_function_flags},
    exception_private::{ExcType, TraceFrame},
    exception_public::Exception,
    heap::HeapStats,
    import::{Importer, ModuleRegistry, ModuleSource, NativeModule},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    resource::{DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker},
    run::Runner,
    tracer::{
        CoverageTracer, NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer, TraceEvent,
        VmTracer,
    },
};
