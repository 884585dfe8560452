//! Resource limits and the eval breaker.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use pretty_assertions::assert_eq;
use pyceval::{
    Code, CodeBuilder, EvalBreaker, ExcType, LimitedTracker, NoLimitTracker, NoPrint, NoopTracer, Object, Opcode,
    ResourceLimits, Runner,
};

/// `def f(): return f()` then `f()`.
fn unbounded_recursion() -> Code {
    let mut f = CodeBuilder::function("f").filename("rec.py");
    f.load_global("f");
    f.call_function(0);
    f.return_value();

    let mut m = CodeBuilder::module("rec.py");
    m.make_function(f.build(), 0);
    m.store_name("f");
    m.load_name("f");
    m.call_function(0);
    m.return_value();
    m.build()
}

/// `try: <body> except: return "caught"`, catching every exception class.
fn catch_all(body: impl FnOnce(&mut CodeBuilder)) -> Code {
    let mut m = CodeBuilder::module("<test>");
    let handler = m.new_label();
    m.emit_jump(Opcode::SetupExcept, handler);
    body(&mut m);
    m.emit(Opcode::PopBlock);
    m.load_none();
    m.return_value();
    m.bind(handler);
    m.pop_top();
    m.pop_top();
    m.pop_top();
    m.emit(Opcode::PopExcept);
    m.load_const("caught");
    m.return_value();
    m.build()
}

/// `while True: x = [1]`
fn allocate_forever(m: &mut CodeBuilder) {
    let top = m.new_label();
    m.bind(top);
    m.load_const(1);
    m.emit_arg(Opcode::BuildList, 1);
    m.store_name("x");
    m.emit_jump(Opcode::JumpAbsolute, top);
}

fn run_limited(code: Code, limits: ResourceLimits) -> Result<Object, pyceval::Exception> {
    Runner::new(code).run(LimitedTracker::new(limits), &mut NoPrint, &mut NoopTracer, None)
}

#[test]
fn recursion_limit_raises_recursion_error() {
    let limits = ResourceLimits::new().max_recursion_depth(Some(50));
    let err = run_limited(unbounded_recursion(), limits).unwrap_err();
    assert_eq!(err.summary(), "RecursionError: maximum recursion depth exceeded");
    assert_eq!(err.traceback().first().map(|frame| frame.name.as_str()), Some("<module>"));
    assert!(err.traceback().iter().skip(1).all(|frame| frame.name == "f"));
}

#[test]
fn recursion_error_is_catchable() {
    let code = catch_all(|m| {
        let mut f = CodeBuilder::function("f");
        f.load_global("f");
        f.call_function(0);
        f.return_value();
        m.make_function(f.build(), 0);
        m.store_name("f");
        m.load_name("f");
        m.call_function(0);
        m.pop_top();
    });
    let result = run_limited(code, ResourceLimits::new().max_recursion_depth(Some(20)));
    assert_eq!(result.unwrap(), Object::Str("caught".to_owned()));
}

#[test]
fn operation_limit_cannot_be_caught() {
    let code = catch_all(|m| {
        let top = m.new_label();
        m.bind(top);
        m.emit_jump(Opcode::JumpAbsolute, top);
    });
    let err = run_limited(code, ResourceLimits::new().max_operations(100)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TimeoutError);
    assert!(err.summary().starts_with("TimeoutError: operation limit exceeded"));
}

#[test]
fn allocation_limit_raises_memory_error() {
    let err = run_limited(catch_all(allocate_forever), ResourceLimits::new().max_allocations(50)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::MemoryError);
}

#[test]
fn pending_call_runs_on_the_evaluating_thread() {
    let breaker = Arc::new(EvalBreaker::new());
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    breaker.add_pending_call(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    }));

    let mut m = CodeBuilder::module("<test>");
    m.load_const(1);
    m.return_value();
    let result = Runner::new(m.build()).run(NoLimitTracker, &mut NoPrint, &mut NoopTracer, Some(Arc::clone(&breaker)));
    assert_eq!(result.unwrap(), Object::Int(1));
    assert!(ran.load(Ordering::SeqCst));
    assert!(!breaker.is_requested());
}

#[test]
fn failing_pending_call_raises_its_exception() {
    let breaker = Arc::new(EvalBreaker::new());
    breaker.add_pending_call(Box::new(|| Err(ExcType::ValueError)));
    let mut m = CodeBuilder::module("<test>");
    m.load_const(1);
    m.return_value();
    let err = Runner::new(m.build())
        .run(NoLimitTracker, &mut NoPrint, &mut NoopTracer, Some(breaker))
        .unwrap_err();
    assert_eq!(err.summary(), "ValueError");
}

#[test]
fn interrupt_stops_a_running_loop() {
    let breaker = Arc::new(EvalBreaker::new());
    let remote = Arc::clone(&breaker);
    let mut m = CodeBuilder::module("<test>");
    let top = m.new_label();
    m.bind(top);
    m.emit_jump(Opcode::JumpAbsolute, top);

    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        remote.interrupt(ExcType::KeyboardInterrupt);
    });
    let err = Runner::new(m.build())
        .run(NoLimitTracker, &mut NoPrint, &mut NoopTracer, Some(breaker))
        .unwrap_err();
    handle.join().unwrap();
    assert_eq!(err.summary(), "KeyboardInterrupt");
}

#[cfg(feature = "ref-count-return")]
#[test]
fn run_releases_every_object() {
    let mut m = CodeBuilder::module("<test>");
    m.load_const(1);
    m.load_const("two");
    m.emit_arg(Opcode::BuildList, 2);
    m.store_name("items");
    m.load_name("len");
    m.load_name("items");
    m.call_function(1);
    m.return_value();
    let output = Runner::new(m.build()).run_ref_counts();
    assert_eq!(output.result.unwrap(), Object::Int(2));
    assert_eq!(output.heap_count, 0, "leaked: {:?}", output.heap_stats.objects_by_type);
}
