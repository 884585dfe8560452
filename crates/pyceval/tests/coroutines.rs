//! Coroutines and async generators driven by hand through `send()`, the way
//! an event loop would step them.

use pretty_assertions::assert_eq;
use pyceval::{Code, CodeBuilder, CompareOp, Exception, Object, Opcode, Runner};

/// Binds every `(name, code)` as a function, calls `main()` and steps the
/// resulting coroutine with `send(None)` until it finishes, returning the
/// `StopIteration.value` it finished with.
fn drive(main: &str, functions: Vec<(&str, Code)>) -> Result<Object, Exception> {
    let mut m = CodeBuilder::module("<test>");
    for (name, code) in functions {
        m.make_function(code, 0);
        m.store_name(name);
    }
    let handler = m.new_label();
    let no_match = m.new_label();
    let end = m.new_label();
    m.load_name(main);
    m.call_function(0);
    m.store_name("coro");
    m.emit_jump(Opcode::SetupExcept, handler);
    m.load_name("coro");
    m.load_attr("send");
    m.load_none();
    m.call_function(1);
    m.store_name("result");
    m.emit(Opcode::PopBlock);
    m.emit_jump(Opcode::JumpForward, end);
    m.bind(handler);
    m.emit(Opcode::DupTop);
    m.load_name("StopIteration");
    m.compare(CompareOp::ExceptionMatch);
    m.emit_jump(Opcode::PopJumpIfFalse, no_match);
    m.pop_top();
    m.load_attr("value");
    m.store_name("result");
    m.pop_top();
    m.emit(Opcode::PopExcept);
    m.emit_jump(Opcode::JumpForward, end);
    m.bind(no_match);
    m.emit(Opcode::EndFinally);
    m.bind(end);
    m.load_name("result");
    m.return_value();
    Runner::new(m.build()).run_no_limits()
}

/// `async def three(): return 3`
fn three() -> Code {
    let mut c = CodeBuilder::function("three").coroutine();
    c.load_const(3);
    c.return_value();
    c.build()
}

fn await_call(c: &mut CodeBuilder, name: &str) {
    c.load_global(name);
    c.call_function(0);
    c.emit(Opcode::GetAwaitable);
    c.load_none();
    c.emit(Opcode::YieldFrom);
}

#[test]
fn await_chain_returns_through_stop_iteration() {
    // async def outer(): return (await three()) + 1
    let mut outer = CodeBuilder::function("outer").coroutine();
    await_call(&mut outer, "three");
    outer.load_const(1);
    outer.emit(Opcode::BinaryAdd);
    outer.return_value();

    let result = drive("outer", vec![("three", three()), ("outer", outer.build())]);
    assert_eq!(result.unwrap(), Object::Int(4));
}

#[test]
fn awaiting_a_non_awaitable_is_type_error() {
    let mut outer = CodeBuilder::function("outer").coroutine();
    outer.load_const(5);
    outer.emit(Opcode::GetAwaitable);
    outer.load_none();
    outer.emit(Opcode::YieldFrom);
    outer.return_value();

    let err = drive("outer", vec![("outer", outer.build())]).unwrap_err();
    assert_eq!(err.summary(), "TypeError: object int can't be used in 'await' expression");
}

#[test]
fn finished_coroutine_cannot_be_resumed() {
    let mut m = CodeBuilder::module("<test>");
    m.make_function(three(), 0);
    m.call_function(0);
    m.store_name("c");
    let handler = m.new_label();
    let end = m.new_label();
    m.emit_jump(Opcode::SetupExcept, handler);
    m.load_name("c");
    m.load_attr("send");
    m.load_none();
    m.call_function(1);
    m.pop_top();
    m.emit(Opcode::PopBlock);
    m.emit_jump(Opcode::JumpForward, end);
    m.bind(handler);
    m.pop_top();
    m.pop_top();
    m.pop_top();
    m.emit(Opcode::PopExcept);
    m.bind(end);
    m.load_name("c");
    m.load_attr("send");
    m.load_none();
    m.call_function(1);
    m.return_value();

    let err = Runner::new(m.build()).run_no_limits().unwrap_err();
    assert_eq!(err.summary(), "RuntimeError: cannot reuse already awaited coroutine");
}

#[test]
fn async_for_sums_async_generator() {
    // async def agen(): yield 1; yield 2; yield 3
    let mut agen = CodeBuilder::function("agen").async_generator();
    for i in 1..=3 {
        agen.load_const(i);
        agen.emit(Opcode::YieldValue);
        agen.pop_top();
    }
    agen.load_none();
    agen.return_value();

    // async def consume():
    //     total = 0
    //     async for x in agen():
    //         total += x
    //     return total
    let mut c = CodeBuilder::function("consume").coroutine();
    let next_item = c.new_label();
    let handler = c.new_label();
    let body = c.new_label();
    let cleanup = c.new_label();
    let after = c.new_label();
    c.load_const(0);
    c.store_fast("total");
    c.emit_jump(Opcode::SetupLoop, after);
    c.load_global("agen");
    c.call_function(0);
    c.emit(Opcode::GetAiter);
    c.load_none();
    c.emit(Opcode::YieldFrom);
    c.bind(next_item);
    c.emit_jump(Opcode::SetupExcept, handler);
    c.emit(Opcode::GetAnext);
    c.load_none();
    c.emit(Opcode::YieldFrom);
    c.store_fast("x");
    c.emit(Opcode::PopBlock);
    c.emit_jump(Opcode::JumpAbsolute, body);
    c.bind(handler);
    c.emit(Opcode::DupTop);
    c.load_global("StopAsyncIteration");
    c.compare(CompareOp::ExceptionMatch);
    c.emit_jump(Opcode::PopJumpIfTrue, cleanup);
    c.emit(Opcode::EndFinally);
    c.bind(body);
    c.load_fast("total");
    c.load_fast("x");
    c.emit(Opcode::InplaceAdd);
    c.store_fast("total");
    c.emit_jump(Opcode::JumpAbsolute, next_item);
    c.bind(cleanup);
    c.pop_top();
    c.pop_top();
    c.pop_top();
    c.emit(Opcode::PopExcept);
    c.pop_top();
    c.emit(Opcode::PopBlock);
    c.bind(after);
    c.load_fast("total");
    c.return_value();

    let result = drive("consume", vec![("agen", agen.build()), ("consume", c.build())]);
    assert_eq!(result.unwrap(), Object::Int(6));
}

#[test]
fn coroutine_object_is_not_iterable() {
    let mut m = CodeBuilder::module("<test>");
    m.load_name("iter");
    m.make_function(three(), 0);
    m.call_function(0);
    m.call_function(1);
    m.return_value();
    let err = Runner::new(m.build()).run_no_limits().unwrap_err();
    assert_eq!(err.summary(), "TypeError: 'coroutine' object is not iterable");
}
