//! Generator frames: suspension, `send`/`throw`/`close`, `yield from` and PEP 479.

use pretty_assertions::assert_eq;
use pyceval::{Code, CodeBuilder, CompareOp, Const, Exception, Object, Opcode, Runner};

/// Module that binds each `(name, code)` as a function, then runs `body`.
fn with_functions(functions: Vec<(&str, Code)>, body: impl FnOnce(&mut CodeBuilder)) -> Result<Object, Exception> {
    let mut m = CodeBuilder::module("<test>");
    for (name, code) in functions {
        m.make_function(code, 0);
        m.store_name(name);
    }
    body(&mut m);
    Runner::new(m.build()).run_no_limits()
}

fn call_method(m: &mut CodeBuilder, receiver: &str, method: &str, args: &[Const]) {
    m.load_name(receiver);
    m.load_attr(method);
    for arg in args {
        m.load_const(arg.clone());
    }
    m.call_function(u32::try_from(args.len()).unwrap());
}

fn call_next(m: &mut CodeBuilder, receiver: &str) {
    m.load_name("next");
    m.load_name(receiver);
    m.call_function(1);
}

/// ```python
/// def acc():
///     total = 0
///     while True:
///         v = yield total
///         total += v
/// ```
fn accumulator() -> Code {
    let mut g = CodeBuilder::function("acc").generator();
    let top = g.new_label();
    let end = g.new_label();
    g.load_const(0);
    g.store_fast("total");
    g.emit_jump(Opcode::SetupLoop, end);
    g.bind(top);
    g.load_fast("total");
    g.emit(Opcode::YieldValue);
    g.store_fast("v");
    g.load_fast("total");
    g.load_fast("v");
    g.emit(Opcode::InplaceAdd);
    g.store_fast("total");
    g.emit_jump(Opcode::JumpAbsolute, top);
    g.bind(end);
    g.load_none();
    g.return_value();
    g.build()
}

#[test]
fn send_resumes_with_value() {
    let result = with_functions(vec![("acc", accumulator())], |m| {
        m.load_name("acc");
        m.call_function(0);
        m.store_name("g");
        call_method(m, "g", "send", &[Const::None]);
        m.pop_top();
        call_method(m, "g", "send", &[Const::Int(5)]);
        m.pop_top();
        call_method(m, "g", "send", &[Const::Int(7)]);
        m.return_value();
    });
    assert_eq!(result.unwrap(), Object::Int(12));
}

#[test]
fn first_send_must_be_none() {
    let err = with_functions(vec![("acc", accumulator())], |m| {
        m.load_name("acc");
        m.call_function(0);
        m.store_name("g");
        call_method(m, "g", "send", &[Const::Int(1)]);
        m.return_value();
    })
    .unwrap_err();
    assert_eq!(
        err.summary(),
        "TypeError: can't send non-None value to a just-started generator"
    );
}

/// ```python
/// def g():
///     try:
///         yield 1
///     except ValueError:
///         yield "caught"
/// ```
fn catching_generator() -> Code {
    let mut g = CodeBuilder::function("g").generator();
    let handler = g.new_label();
    let no_match = g.new_label();
    let end = g.new_label();
    g.emit_jump(Opcode::SetupExcept, handler);
    g.load_const(1);
    g.emit(Opcode::YieldValue);
    g.pop_top();
    g.emit(Opcode::PopBlock);
    g.emit_jump(Opcode::JumpForward, end);
    g.bind(handler);
    g.emit(Opcode::DupTop);
    g.load_global("ValueError");
    g.compare(CompareOp::ExceptionMatch);
    g.emit_jump(Opcode::PopJumpIfFalse, no_match);
    g.pop_top();
    g.pop_top();
    g.pop_top();
    g.load_const("caught");
    g.emit(Opcode::YieldValue);
    g.pop_top();
    g.emit(Opcode::PopExcept);
    g.emit_jump(Opcode::JumpForward, end);
    g.bind(no_match);
    g.emit(Opcode::EndFinally);
    g.bind(end);
    g.load_none();
    g.return_value();
    g.build()
}

#[test]
fn throw_is_handled_at_the_suspension_point() {
    let result = with_functions(vec![("g", catching_generator())], |m| {
        m.load_name("g");
        m.call_function(0);
        m.store_name("it");
        call_next(m, "it");
        m.pop_top();
        m.load_name("it");
        m.load_attr("throw");
        m.load_name("ValueError");
        m.call_function(1);
        m.return_value();
    });
    assert_eq!(result.unwrap(), Object::Str("caught".to_owned()));
}

#[test]
fn unhandled_throw_propagates_and_finishes_generator() {
    let err = with_functions(vec![("g", catching_generator())], |m| {
        m.load_name("g");
        m.call_function(0);
        m.store_name("it");
        call_next(m, "it");
        m.pop_top();
        m.load_name("it");
        m.load_attr("throw");
        m.load_name("KeyError");
        m.load_const("k");
        m.call_function(2);
        m.return_value();
    })
    .unwrap_err();
    assert_eq!(err.summary(), "KeyError: 'k'");
    let names: Vec<&str> = err.traceback().iter().map(|frame| frame.name.as_str()).collect();
    assert_eq!(names, vec!["<module>", "g"]);
}

/// ```python
/// def g():
///     try:
///         yield 1
///     finally:
///         global done; done = True
///         <extra>
/// ```
fn finally_generator(extra: impl FnOnce(&mut CodeBuilder)) -> Code {
    let mut g = CodeBuilder::function("g").generator();
    let fin = g.new_label();
    g.emit_jump(Opcode::SetupFinally, fin);
    g.load_const(1);
    g.emit(Opcode::YieldValue);
    g.pop_top();
    g.emit(Opcode::PopBlock);
    g.load_none();
    g.bind(fin);
    g.load_const(Const::Bool(true));
    g.store_global("done");
    extra(&mut g);
    g.emit(Opcode::EndFinally);
    g.load_none();
    g.return_value();
    g.build()
}

fn close_after_first_yield(code: Code) -> Result<Object, Exception> {
    with_functions(vec![("g", code)], |m| {
        m.load_const(Const::Bool(false));
        m.store_name("done");
        m.load_name("g");
        m.call_function(0);
        m.store_name("it");
        call_next(m, "it");
        m.pop_top();
        call_method(m, "it", "close", &[]);
        m.pop_top();
        m.load_name("done");
        m.return_value();
    })
}

#[test]
fn close_runs_finally() {
    let result = close_after_first_yield(finally_generator(|_| {}));
    assert_eq!(result.unwrap(), Object::Bool(true));
}

#[test]
fn yielding_from_finally_during_close_is_runtime_error() {
    let code = finally_generator(|g| {
        g.load_const(2);
        g.emit(Opcode::YieldValue);
        g.pop_top();
    });
    let err = close_after_first_yield(code).unwrap_err();
    assert_eq!(err.summary(), "RuntimeError: generator ignored GeneratorExit");
}

#[test]
fn close_on_unstarted_generator_skips_body() {
    let result = with_functions(vec![("g", finally_generator(|_| {}))], |m| {
        m.load_const(Const::Bool(false));
        m.store_name("done");
        m.load_name("g");
        m.call_function(0);
        m.store_name("it");
        call_method(m, "it", "close", &[]);
        m.pop_top();
        m.load_name("done");
        m.return_value();
    });
    assert_eq!(result.unwrap(), Object::Bool(false));
}

#[test]
fn stop_iteration_escaping_generator_becomes_runtime_error() {
    let mut g = CodeBuilder::function("g").generator();
    g.load_global("StopIteration");
    g.emit_arg(Opcode::RaiseVarargs, 1);
    let err = with_functions(vec![("g", g.build())], |m| {
        m.load_name("g");
        m.call_function(0);
        m.store_name("it");
        call_next(m, "it");
        m.return_value();
    })
    .unwrap_err();
    assert_eq!(err.summary(), "RuntimeError: generator raised StopIteration");
    assert_eq!(err.cause().map(Exception::summary), Some("StopIteration".to_owned()));
}

#[test]
fn yield_from_forwards_values_and_result() {
    // def inner(): yield 1; return "r"
    let mut inner = CodeBuilder::function("inner").generator();
    inner.load_const(1);
    inner.emit(Opcode::YieldValue);
    inner.pop_top();
    inner.load_const("r");
    inner.return_value();

    // def outer(): x = yield from inner(); yield x
    let mut outer = CodeBuilder::function("outer").generator();
    outer.load_global("inner");
    outer.call_function(0);
    outer.emit(Opcode::GetYieldFromIter);
    outer.load_none();
    outer.emit(Opcode::YieldFrom);
    outer.store_fast("x");
    outer.load_fast("x");
    outer.emit(Opcode::YieldValue);
    outer.pop_top();
    outer.load_none();
    outer.return_value();

    let result = with_functions(vec![("inner", inner.build()), ("outer", outer.build())], |m| {
        m.load_name("outer");
        m.call_function(0);
        m.store_name("it");
        call_next(m, "it");
        call_next(m, "it");
        m.emit_arg(Opcode::BuildTuple, 2);
        m.return_value();
    });
    assert_eq!(result.unwrap().to_string(), "(1, 'r')");
}

#[test]
fn exhausted_generator_raises_stop_iteration() {
    let mut g = CodeBuilder::function("g").generator();
    g.load_const(1);
    g.emit(Opcode::YieldValue);
    g.pop_top();
    g.load_const("done");
    g.return_value();
    let err = with_functions(vec![("g", g.build())], |m| {
        m.load_name("g");
        m.call_function(0);
        m.store_name("it");
        call_next(m, "it");
        m.pop_top();
        call_next(m, "it");
        m.return_value();
    })
    .unwrap_err();
    assert_eq!(err.summary(), "StopIteration: done");
}

#[test]
fn builtins_consume_generators() {
    let mut g = CodeBuilder::function("g").generator();
    for i in 1..=4 {
        g.load_const(i);
        g.emit(Opcode::YieldValue);
        g.pop_top();
    }
    g.load_none();
    g.return_value();
    let result = with_functions(vec![("g", g.build())], |m| {
        m.load_name("sum");
        m.load_name("g");
        m.call_function(0);
        m.call_function(1);
        m.load_name("list");
        m.load_name("g");
        m.call_function(0);
        m.call_function(1);
        m.emit_arg(Opcode::BuildTuple, 2);
        m.return_value();
    });
    assert_eq!(result.unwrap().to_string(), "(10, [1, 2, 3, 4])");
}

/// ```python
/// def g():
///     try:
///         raise KeyError('k')
///     except:
///         yield 1
///         yield sys.exc_info()[0]
/// ```
fn yields_inside_handler() -> Code {
    let mut g = CodeBuilder::function("g").generator();
    let handler = g.new_label();
    let end = g.new_label();
    g.emit_jump(Opcode::SetupExcept, handler);
    g.load_global("KeyError");
    g.load_const("k");
    g.call_function(1);
    g.emit_arg(Opcode::RaiseVarargs, 1);
    g.emit(Opcode::PopBlock);
    g.emit_jump(Opcode::JumpForward, end);
    g.bind(handler);
    g.pop_top();
    g.pop_top();
    g.pop_top();
    g.load_const(1);
    g.emit(Opcode::YieldValue);
    g.pop_top();
    g.load_global("sys");
    g.load_attr("exc_info");
    g.call_function(0);
    g.load_const(0);
    g.emit(Opcode::BinarySubscr);
    g.emit(Opcode::YieldValue);
    g.pop_top();
    g.emit(Opcode::PopExcept);
    g.bind(end);
    g.load_none();
    g.return_value();
    g.build()
}

#[test]
fn generator_resumed_from_another_handler_sees_its_own_exception() {
    // it = g(); next(it)
    // try: raise ValueError('v')
    // except: r = next(it); outer = sys.exc_info()[0]
    // (str(r), str(outer))
    let result = with_functions(vec![("g", yields_inside_handler())], |m| {
        m.load_const(0);
        m.load_none();
        m.import_name("sys");
        m.store_name("sys");
        m.load_name("g");
        m.call_function(0);
        m.store_name("it");
        call_next(m, "it");
        m.pop_top();
        let handler = m.new_label();
        let end = m.new_label();
        m.emit_jump(Opcode::SetupExcept, handler);
        m.load_name("ValueError");
        m.load_const("v");
        m.call_function(1);
        m.emit_arg(Opcode::RaiseVarargs, 1);
        m.emit(Opcode::PopBlock);
        m.emit_jump(Opcode::JumpForward, end);
        m.bind(handler);
        m.pop_top();
        m.pop_top();
        m.pop_top();
        call_next(m, "it");
        m.store_name("r");
        m.load_name("sys");
        m.load_attr("exc_info");
        m.call_function(0);
        m.load_const(0);
        m.emit(Opcode::BinarySubscr);
        m.store_name("outer");
        m.emit(Opcode::PopExcept);
        m.bind(end);
        for name in ["r", "outer"] {
            m.load_name("str");
            m.load_name(name);
            m.call_function(1);
        }
        m.emit_arg(Opcode::BuildTuple, 2);
        m.return_value();
    });
    assert_eq!(
        result.unwrap(),
        Object::Tuple(vec![
            Object::Str("<class 'KeyError'>".to_owned()),
            Object::Str("<class 'ValueError'>".to_owned()),
        ])
    );
}
