//! Block-stack behaviour: loops, `try`/`except`/`finally` and how pending
//! `return`/`break`/`continue` travel through `finally` clauses.

use pretty_assertions::assert_eq;
use pyceval::{CodeBuilder, CompareOp, Const, Exception, Object, Opcode, RecordingTracer, Runner, TraceEvent};

fn run(b: CodeBuilder) -> Result<Object, Exception> {
    Runner::new(b.build()).run_no_limits()
}

/// Emits `SETUP_LOOP; for <target> in range(<n>):` and returns the labels
/// `(loop top, iterator exhausted, after loop)`.
fn for_range(b: &mut CodeBuilder, n: i64, target: &str) -> (pyceval::Label, pyceval::Label, pyceval::Label) {
    let top = b.new_label();
    let exhausted = b.new_label();
    let end = b.new_label();
    b.emit_jump(Opcode::SetupLoop, end);
    b.load_name("range");
    b.load_const(n);
    b.call_function(1);
    b.emit(Opcode::GetIter);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, exhausted);
    b.store_name(target);
    (top, exhausted, end)
}

fn increment(b: &mut CodeBuilder, name: &str) {
    b.load_name(name);
    b.load_const(1);
    b.emit(Opcode::InplaceAdd);
    b.store_name(name);
}

#[test]
fn return_runs_enclosing_finally() {
    // def f():
    //     try:
    //         return 1
    //     finally:
    //         global marker; marker = "done"
    let mut f = CodeBuilder::function("f");
    let fin = f.new_label();
    f.emit_jump(Opcode::SetupFinally, fin);
    f.load_const(1);
    f.return_value();
    f.emit(Opcode::PopBlock);
    f.load_none();
    f.bind(fin);
    f.load_const("done");
    f.store_global("marker");
    f.emit(Opcode::EndFinally);
    f.load_none();
    f.return_value();

    let mut m = CodeBuilder::module("<test>");
    m.make_function(f.build(), 0);
    m.call_function(0);
    m.store_name("r");
    m.load_name("r");
    m.load_name("marker");
    m.emit_arg(Opcode::BuildTuple, 2);
    m.return_value();
    assert_eq!(run(m).unwrap().to_string(), "(1, 'done')");
}

#[test]
fn return_in_finally_replaces_pending_return() {
    let mut f = CodeBuilder::function("f");
    let fin = f.new_label();
    f.emit_jump(Opcode::SetupFinally, fin);
    f.load_const(1);
    f.return_value();
    f.emit(Opcode::PopBlock);
    f.load_none();
    f.bind(fin);
    f.load_const(2);
    f.return_value();
    f.emit(Opcode::EndFinally);

    let mut m = CodeBuilder::module("<test>");
    m.make_function(f.build(), 0);
    m.call_function(0);
    m.return_value();
    assert_eq!(run(m).unwrap(), Object::Int(2));
}

#[test]
fn break_inside_try_runs_finally_then_leaves_loop() {
    // n = 0
    // for i in range(10):
    //     try:
    //         if i == 3: break
    //     finally:
    //         n += 1
    let mut b = CodeBuilder::module("<test>");
    b.load_const(0);
    b.store_name("n");
    let (top, exhausted, end) = for_range(&mut b, 10, "i");
    let fin = b.new_label();
    let no_break = b.new_label();
    b.emit_jump(Opcode::SetupFinally, fin);
    b.load_name("i");
    b.load_const(3);
    b.compare(CompareOp::Eq);
    b.emit_jump(Opcode::PopJumpIfFalse, no_break);
    b.emit(Opcode::BreakLoop);
    b.bind(no_break);
    b.emit(Opcode::PopBlock);
    b.load_none();
    b.bind(fin);
    increment(&mut b, "n");
    b.emit(Opcode::EndFinally);
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind(exhausted);
    b.emit(Opcode::PopBlock);
    b.bind(end);
    b.load_name("i");
    b.load_name("n");
    b.emit_arg(Opcode::BuildTuple, 2);
    b.return_value();
    assert_eq!(run(b).unwrap().to_string(), "(3, 4)");
}

#[test]
fn continue_inside_try_runs_finally_every_iteration() {
    // for i in range(5):
    //     try:
    //         if i % 2: continue
    //         m += 1
    //     finally:
    //         n += 1
    let mut b = CodeBuilder::module("<test>");
    b.load_const(0);
    b.store_name("m");
    b.load_const(0);
    b.store_name("n");
    let (top, exhausted, end) = for_range(&mut b, 5, "i");
    let fin = b.new_label();
    let even = b.new_label();
    b.emit_jump(Opcode::SetupFinally, fin);
    b.load_name("i");
    b.load_const(2);
    b.emit(Opcode::BinaryModulo);
    b.emit_jump(Opcode::PopJumpIfFalse, even);
    b.emit_jump(Opcode::ContinueLoop, top);
    b.bind(even);
    increment(&mut b, "m");
    b.emit(Opcode::PopBlock);
    b.load_none();
    b.bind(fin);
    increment(&mut b, "n");
    b.emit(Opcode::EndFinally);
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind(exhausted);
    b.emit(Opcode::PopBlock);
    b.bind(end);
    b.load_name("m");
    b.load_name("n");
    b.emit_arg(Opcode::BuildTuple, 2);
    b.return_value();
    assert_eq!(run(b).unwrap().to_string(), "(3, 5)");
}

/// `try: 1 / 0  except <clause> as e: msg = str(e)`, then `(msg, sys.exc_info()[0])`.
fn divide_and_catch(clause: &str) -> Result<Object, Exception> {
    let mut b = CodeBuilder::module("<test>");
    b.load_const(0);
    b.load_none();
    b.import_name("sys");
    b.store_name("sys");
    b.load_const("unset");
    b.store_name("msg");
    let handler = b.new_label();
    let no_match = b.new_label();
    let end = b.new_label();
    b.emit_jump(Opcode::SetupExcept, handler);
    b.load_const(1);
    b.load_const(0);
    b.emit(Opcode::BinaryTrueDivide);
    b.pop_top();
    b.emit(Opcode::PopBlock);
    b.emit_jump(Opcode::JumpForward, end);
    b.bind(handler);
    b.emit(Opcode::DupTop);
    b.load_name(clause);
    b.compare(CompareOp::ExceptionMatch);
    b.emit_jump(Opcode::PopJumpIfFalse, no_match);
    b.pop_top();
    b.store_name("e");
    b.pop_top();
    b.load_name("str");
    b.load_name("e");
    b.call_function(1);
    b.store_name("msg");
    b.emit(Opcode::PopExcept);
    b.emit_jump(Opcode::JumpForward, end);
    b.bind(no_match);
    b.emit(Opcode::EndFinally);
    b.bind(end);
    b.load_name("msg");
    b.load_name("sys");
    b.load_attr("exc_info");
    b.call_function(0);
    b.load_const(0);
    b.emit(Opcode::BinarySubscr);
    b.emit_arg(Opcode::BuildTuple, 2);
    b.return_value();
    run(b)
}

#[test]
fn except_clause_catches_and_restores_exc_info() {
    let result = divide_and_catch("ArithmeticError").unwrap();
    assert_eq!(result.to_string(), "('division by zero', None)");
}

#[test]
fn non_matching_except_clause_reraises() {
    let err = divide_and_catch("KeyError").unwrap_err();
    assert_eq!(err.summary(), "ZeroDivisionError: division by zero");
    assert_eq!(err.traceback().len(), 1);
}

#[test]
fn traceback_lists_frames_outermost_first() {
    let mut f = CodeBuilder::function("inner").filename("tb.py").first_line(10);
    f.set_line(11);
    f.load_global("ValueError");
    f.load_const("bad");
    f.call_function(1);
    f.emit_arg(Opcode::RaiseVarargs, 1);

    let mut m = CodeBuilder::module("tb.py");
    m.make_function(f.build(), 0);
    m.store_name("inner");
    m.set_line(5);
    m.load_name("inner");
    m.call_function(0);
    m.return_value();

    let err = run(m).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Traceback (most recent call last):\n  File \"tb.py\", line 5, in <module>\n  File \"tb.py\", line 11, in inner\nValueError: bad\n"
    );
}

#[test]
fn raise_from_sets_cause() {
    let mut b = CodeBuilder::module("<test>");
    b.load_name("RuntimeError");
    b.load_const("outer");
    b.call_function(1);
    b.load_name("ValueError");
    b.load_const("inner");
    b.call_function(1);
    b.emit_arg(Opcode::RaiseVarargs, 2);

    let err = run(b).unwrap_err();
    assert_eq!(err.summary(), "RuntimeError: outer");
    assert_eq!(err.cause().map(Exception::summary), Some("ValueError: inner".to_owned()));
    assert!(err.context().is_none());
    assert!(
        err.to_string()
            .contains("The above exception was the direct cause of the following exception")
    );
}

#[test]
fn raise_inside_handler_chains_context() {
    // try: 1 / 0
    // except ZeroDivisionError: raise ValueError("again")
    let mut b = CodeBuilder::module("<test>");
    let handler = b.new_label();
    let end = b.new_label();
    b.emit_jump(Opcode::SetupExcept, handler);
    b.load_const(1);
    b.load_const(0);
    b.emit(Opcode::BinaryTrueDivide);
    b.pop_top();
    b.emit(Opcode::PopBlock);
    b.emit_jump(Opcode::JumpForward, end);
    b.bind(handler);
    b.pop_top();
    b.pop_top();
    b.pop_top();
    b.load_name("ValueError");
    b.load_const("again");
    b.call_function(1);
    b.emit_arg(Opcode::RaiseVarargs, 1);
    b.bind(end);
    b.load_none();
    b.return_value();

    let err = run(b).unwrap_err();
    assert_eq!(err.summary(), "ValueError: again");
    let context = err.context().expect("implicit context");
    assert_eq!(context.summary(), "ZeroDivisionError: division by zero");
}

#[test]
fn bare_raise_without_active_exception() {
    let mut b = CodeBuilder::module("<test>");
    b.emit_arg(Opcode::RaiseVarargs, 0);
    let err = run(b).unwrap_err();
    assert_eq!(err.summary(), "RuntimeError: No active exception to reraise");
}

#[test]
fn raising_a_non_exception_is_type_error() {
    let mut b = CodeBuilder::module("<test>");
    b.load_const(Const::Int(3));
    b.emit_arg(Opcode::RaiseVarargs, 1);
    let err = run(b).unwrap_err();
    assert_eq!(err.summary(), "TypeError: exceptions must derive from BaseException");
}

#[test]
fn tracer_sees_calls_and_handler_entry() {
    let mut f = CodeBuilder::function("f");
    f.load_const(1);
    f.return_value();

    let mut m = CodeBuilder::module("<test>");
    let handler = m.new_label();
    let end = m.new_label();
    m.make_function(f.build(), 0);
    m.call_function(0);
    m.pop_top();
    m.emit_jump(Opcode::SetupExcept, handler);
    m.load_name("undefined");
    m.pop_top();
    m.emit(Opcode::PopBlock);
    m.emit_jump(Opcode::JumpForward, end);
    m.bind(handler);
    m.pop_top();
    m.pop_top();
    m.pop_top();
    m.emit(Opcode::PopExcept);
    m.bind(end);
    m.load_none();
    m.return_value();

    let mut tracer = RecordingTracer::new();
    let result = Runner::new(m.build()).run(pyceval::NoLimitTracker, &mut pyceval::NoPrint, &mut tracer, None);
    assert_eq!(result.unwrap(), Object::None);

    let calls: Vec<(String, usize)> = tracer
        .events()
        .iter()
        .filter_map(|event| match event {
            TraceEvent::Call { func_name, depth } => Some((func_name.clone(), *depth)),
            _ => None,
        })
        .collect();
    assert_eq!(calls, vec![("<module>".to_owned(), 1), ("f".to_owned(), 2)]);
    assert!(tracer.events().iter().any(|event| matches!(
        event,
        TraceEvent::Exception {
            exc_type: pyceval::ExcType::NameError,
            depth: 1
        }
    )));
    assert!(
        tracer
            .events()
            .iter()
            .any(|event| matches!(event, TraceEvent::Unwind { reason: "exception", .. }))
    );
}

#[test]
fn out_of_range_local_in_nested_code_is_rejected_before_running() {
    let mut f = CodeBuilder::function("f");
    f.emit_arg(Opcode::LoadFast, 9);
    f.return_value();

    let mut m = CodeBuilder::module("<test>");
    m.make_function(f.build(), 0);
    m.return_value();

    let err = run(m).unwrap_err();
    assert_eq!(err.exc_type(), pyceval::ExcType::SystemError);
    assert!(err.summary().contains("LOAD_FAST"), "{}", err.summary());
}

#[test]
fn store_to_missing_fast_slot_is_system_error() {
    let mut b = CodeBuilder::module("<test>");
    b.load_const(1);
    b.emit_arg(Opcode::StoreFast, 9);
    b.load_none();
    b.return_value();
    let err = run(b).unwrap_err();
    assert!(err.summary().starts_with("SystemError"), "{}", err.summary());
}

#[test]
fn popping_an_empty_stack_is_system_error() {
    let mut b = CodeBuilder::module("<test>");
    b.pop_top();
    b.load_none();
    b.return_value();
    let err = run(b).unwrap_err();
    assert_eq!(err.summary(), "SystemError: operand stack underflow");
}

#[test]
fn stack_underflow_is_catchable() {
    // try: ROT_TWO on an empty stack
    // except: return "caught"
    let mut b = CodeBuilder::module("<test>");
    let handler = b.new_label();
    b.emit_jump(Opcode::SetupExcept, handler);
    b.emit(Opcode::RotTwo);
    b.emit(Opcode::PopBlock);
    b.load_none();
    b.return_value();
    b.bind(handler);
    b.pop_top();
    b.pop_top();
    b.pop_top();
    b.emit(Opcode::PopExcept);
    b.load_const("caught");
    b.return_value();
    assert_eq!(run(b).unwrap(), Object::Str("caught".to_owned()));
}

#[test]
fn exception_passes_through_finally_unchanged() {
    // try: raise KeyError('k')
    // finally: done = True
    let mut b = CodeBuilder::module("<test>");
    let fin = b.new_label();
    b.emit_jump(Opcode::SetupFinally, fin);
    b.load_name("KeyError");
    b.load_const("k");
    b.call_function(1);
    b.emit_arg(Opcode::RaiseVarargs, 1);
    b.emit(Opcode::PopBlock);
    b.load_none();
    b.bind(fin);
    b.load_const(Const::Bool(true));
    b.store_name("done");
    b.emit(Opcode::EndFinally);
    b.load_none();
    b.return_value();

    let err = run(b).unwrap_err();
    assert_eq!(err.exc_type(), pyceval::ExcType::KeyError);
    assert_eq!(err.summary(), "KeyError: 'k'");
    assert!(err.context().is_none());
    assert_eq!(err.traceback().len(), 1);
}

#[test]
fn coverage_counts_each_offset_once() {
    let mut f = CodeBuilder::function("f");
    f.load_const(1);
    f.return_value();

    let mut m = CodeBuilder::module("<test>");
    m.make_function(f.build(), 0);
    m.store_name("f");
    m.load_name("f");
    m.call_function(0);
    m.pop_top();
    m.load_name("f");
    m.call_function(0);
    m.return_value();

    let mut tracer = pyceval::CoverageTracer::new();
    Runner::new(m.build())
        .run(pyceval::NoLimitTracker, &mut pyceval::NoPrint, &mut tracer, None)
        .unwrap();
    assert_eq!(tracer.covered("f").map(|offsets| offsets.len()), Some(2));
    assert!(tracer.coverage_count() > 2);
}
