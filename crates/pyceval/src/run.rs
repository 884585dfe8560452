//! Public interface for running code objects.
use std::{rc::Rc, sync::Arc};

use crate::{
    Exception,
    breaker::EvalBreaker,
    bytecode::{Code, vm::VM},
    heap::Heap,
    import::{Importer, ModuleRegistry},
    io::{PrintWriter, StdPrint},
    object::Object,
    resource::{NoLimitTracker, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
};

/// Initial arena capacity; the heap grows past it as needed.
const HEAP_CAPACITY: usize = 64;

/// Primary interface for evaluating a module-level [`Code`].
///
/// Every run starts from fresh globals, builtins and `sys.modules`, so a runner
/// can be executed any number of times.
///
/// # Example
/// ```
/// use pyceval::{CodeBuilder, Object, Runner};
///
/// let mut b = CodeBuilder::module("<example>");
/// b.load_const(41);
/// b.load_const(1);
/// b.emit(pyceval::Opcode::BinaryAdd);
/// b.return_value();
/// let result = Runner::new(b.build()).run_no_limits().unwrap();
/// assert_eq!(result, Object::Int(42));
/// ```
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Runner {
    code: Rc<Code>,
}

impl Runner {
    #[must_use]
    pub fn new(code: Code) -> Self {
        Self { code: Rc::new(code) }
    }

    /// The module code this runner evaluates.
    #[must_use]
    pub fn code(&self) -> &Code {
        &self.code
    }

    /// Runs to completion with no resource limits beyond the recursion ceiling,
    /// printing to stdout.
    pub fn run_no_limits(&self) -> Result<Object, Exception> {
        self.run(NoLimitTracker, &mut StdPrint, &mut NoopTracer, None)
    }

    /// Runs to completion with the default importer (`sys`, `contextlib`).
    ///
    /// # Arguments
    /// * `resource_tracker` - Limits enforced while evaluating
    /// * `print` - Destination of `print()` output
    /// * `tracer` - Receives VM events
    /// * `breaker` - Lets other threads interrupt the run or queue calls onto it
    pub fn run(
        &self,
        resource_tracker: impl ResourceTracker,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
        breaker: Option<Arc<EvalBreaker>>,
    ) -> Result<Object, Exception> {
        self.run_with_importer(resource_tracker, print, tracer, &ModuleRegistry::new(), breaker)
    }

    /// Like [`Runner::run`], resolving imports through `importer`.
    pub fn run_with_importer(
        &self,
        resource_tracker: impl ResourceTracker,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
        importer: &dyn Importer,
        breaker: Option<Arc<EvalBreaker>>,
    ) -> Result<Object, Exception> {
        let mut heap = Heap::new(HEAP_CAPACITY, resource_tracker);
        self.execute(&mut heap, print, tracer, importer, breaker)
    }

    /// Runs with no limits and reports what is left on the heap afterwards, used for testing only.
    ///
    /// Every object the run allocated should have been released once the VM is
    /// torn down and the result converted, so `heap_count` is expected to be zero.
    #[cfg(feature = "ref-count-return")]
    pub fn run_ref_counts(&self) -> RefCountOutput {
        let mut heap = Heap::new(HEAP_CAPACITY, NoLimitTracker);
        let result = self.execute(&mut heap, &mut StdPrint, &mut NoopTracer, &ModuleRegistry::new(), None);
        RefCountOutput {
            result,
            heap_count: heap.entry_count(),
            heap_stats: heap.heap_stats(),
        }
    }

    fn execute<T: ResourceTracker>(
        &self,
        heap: &mut Heap<T>,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
        importer: &dyn Importer,
        breaker: Option<Arc<EvalBreaker>>,
    ) -> Result<Object, Exception> {
        let mut vm = match VM::new(heap, print, tracer, importer, breaker) {
            Ok(vm) => vm,
            Err(e) => return Err(Exception::from_run_error(e, heap)),
        };
        let output = match vm.run_module(Rc::clone(&self.code)) {
            Ok(value) => Ok(Object::new(value, vm.heap)),
            Err(e) => Err(Exception::from_run_error(e, vm.heap)),
        };
        vm.teardown();
        output
    }

    /// Serializes the runner to postcard bytes.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserializes a runner produced by [`Runner::dump`].
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid runner.
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Output of `run_ref_counts`: the run's result plus the heap left behind.
#[cfg(feature = "ref-count-return")]
#[derive(Debug)]
pub struct RefCountOutput {
    pub result: Result<Object, Exception>,
    /// Live heap entries after teardown; non-zero means a leaked reference.
    pub heap_count: usize,
    pub heap_stats: crate::HeapStats,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Runner;
    use crate::{CodeBuilder, Object, Opcode};

    #[test]
    fn dump_and_load_preserve_behaviour() {
        let mut b = CodeBuilder::module("<test>");
        b.load_const("x");
        b.load_const(3);
        b.emit(Opcode::BinaryMultiply);
        b.return_value();
        let runner = Runner::new(b.build());
        let loaded = Runner::load(&runner.dump().unwrap()).unwrap();
        assert_eq!(loaded.run_no_limits().unwrap(), Object::Str("xxx".to_owned()));
    }
}
