//! Bytecode representation and evaluation.
//!
//! # Module Structure
//!
//! - `op` - opcode numbering, stack effects and argument flags
//! - `code` - code objects, constants and the line table
//! - `builder` - `CodeBuilder` for assembling wordcode with labels
//! - `vm` - the evaluation loop, block stack, unwinding and generators

pub use builder::{CodeBuilder, Label};
pub(crate) use code::CodeObject;
pub use code::{Code, CodeFlags, Const};
pub use op::{CompareOp, HAVE_ARGUMENT, Opcode, format_flags, make_function_flags};

mod builder;
mod code;
mod op;
pub(crate) mod vm;
