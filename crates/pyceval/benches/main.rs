// Use codspeed-criterion-compat when running on CodSpeed (CI), real criterion otherwise (for flamegraphs)
#[cfg(codspeed)]
use codspeed_criterion_compat::{Bencher, Criterion, black_box, criterion_group, criterion_main};
#[cfg(not(codspeed))]
use criterion::{Bencher, Criterion, black_box, criterion_group, criterion_main};
use pyceval::{Code, CodeBuilder, CompareOp, Object, Opcode, Runner};

/// Runs a benchmark of one module-level code object, checking its result first.
fn run_code(bench: &mut Bencher, code: Code, expected: i64) {
    let runner = Runner::new(code);
    let r = runner.run_no_limits().unwrap();
    assert_eq!(r, Object::Int(expected));

    bench.iter(|| {
        let r = runner.run_no_limits().unwrap();
        black_box(r);
    });
}

/// `total = 0; for i in range(n): total += i; total`
fn sum_range(n: i64) -> Code {
    let mut b = CodeBuilder::module("sum_range.py");
    b.load_const(0);
    b.store_name("total");
    let end = b.new_label();
    let top = b.new_label();
    let exhausted = b.new_label();
    b.emit_jump(Opcode::SetupLoop, end);
    b.load_name("range");
    b.load_const(n);
    b.call_function(1);
    b.emit(Opcode::GetIter);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, exhausted);
    b.store_name("i");
    b.load_name("total");
    b.load_name("i");
    b.emit(Opcode::InplaceAdd);
    b.store_name("total");
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind(exhausted);
    b.emit(Opcode::PopBlock);
    b.bind(end);
    b.load_name("total");
    b.return_value();
    b.build()
}

/// Naive recursive `fib(n)`, stressing frame setup and teardown.
fn fib(n: i64) -> Code {
    let mut f = CodeBuilder::function("fib").filename("fib.py").args(&["n"]);
    let recurse = f.new_label();
    f.load_fast("n");
    f.load_const(2);
    f.compare(CompareOp::Lt);
    f.emit_jump(Opcode::PopJumpIfFalse, recurse);
    f.load_fast("n");
    f.return_value();
    f.bind(recurse);
    for step in [1, 2] {
        f.load_global("fib");
        f.load_fast("n");
        f.load_const(step);
        f.emit(Opcode::BinarySubtract);
        f.call_function(1);
    }
    f.emit(Opcode::BinaryAdd);
    f.return_value();

    let mut m = CodeBuilder::module("fib.py");
    m.make_function(f.build(), 0);
    m.store_name("fib");
    m.load_name("fib");
    m.load_const(n);
    m.call_function(1);
    m.return_value();
    m.build()
}

/// `[x * 2 for x in range(n)]` summed with the `sum` builtin.
fn list_comprehension(n: i64) -> Code {
    let mut comp = CodeBuilder::function("<listcomp>").args(&[".0"]);
    let top = comp.new_label();
    let done = comp.new_label();
    comp.emit_arg(Opcode::BuildList, 0);
    comp.load_fast(".0");
    comp.bind(top);
    comp.emit_jump(Opcode::ForIter, done);
    comp.store_fast("x");
    comp.load_fast("x");
    comp.load_const(2);
    comp.emit(Opcode::BinaryMultiply);
    comp.emit_arg(Opcode::ListAppend, 2);
    comp.emit_jump(Opcode::JumpAbsolute, top);
    comp.bind(done);
    comp.return_value();

    let mut m = CodeBuilder::module("listcomp.py");
    m.load_name("sum");
    m.make_function(comp.build(), 0);
    m.load_name("range");
    m.load_const(n);
    m.call_function(1);
    m.emit(Opcode::GetIter);
    m.call_function(1);
    m.call_function(1);
    m.return_value();
    m.build()
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("sum_range_1000", |b| run_code(b, sum_range(1000), 499_500));
    c.bench_function("fib_15", |b| run_code(b, fib(15), 610));
    c.bench_function("list_comprehension_1000", |b| {
        run_code(b, list_comprehension(1000), 999_000);
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
