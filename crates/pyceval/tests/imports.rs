//! `IMPORT_NAME` / `IMPORT_FROM` against host-registered modules.

use pretty_assertions::assert_eq;
use pyceval::{
    Code, CodeBuilder, CollectStringPrint, Const, Exception, ModuleRegistry, NoLimitTracker, NoopTracer, Object,
    Opcode, Runner,
};

fn run_with(registry: &ModuleRegistry, main: Code) -> Result<Object, Exception> {
    Runner::new(main).run_with_importer(NoLimitTracker, &mut CollectStringPrint::new(), &mut NoopTracer, registry, None)
}

/// Pushes `level` and `fromlist`, then emits `IMPORT_NAME name`.
fn import(b: &mut CodeBuilder, name: &str, level: i64, fromlist: &[&str]) {
    b.load_const(level);
    if fromlist.is_empty() {
        b.load_none();
    } else {
        b.load_const(Const::Tuple(fromlist.iter().map(|&n| Const::from(n)).collect()));
    }
    b.import_name(name);
}

/// `from <name> import <attr>` followed by `return <attr>`, at `level`.
fn from_import_and_return(filename: &str, name: &str, level: i64, attr: &str) -> Code {
    let mut b = CodeBuilder::module(filename);
    import(&mut b, name, level, &[attr]);
    b.import_from(attr);
    b.store_name(attr);
    b.pop_top();
    b.load_name(attr);
    b.return_value();
    b.build()
}

fn assign_module(filename: &str, name: &str, value: i64) -> Code {
    let mut b = CodeBuilder::module(filename);
    b.load_const(value);
    b.store_name(name);
    b.load_none();
    b.return_value();
    b.build()
}

#[test]
fn from_import_reads_module_global() {
    let registry = ModuleRegistry::new().with_module("helper", assign_module("helper.py", "value", 41));
    let result = run_with(&registry, from_import_and_return("main.py", "helper", 0, "value"));
    assert_eq!(result.unwrap(), Object::Int(41));
}

#[test]
fn module_body_runs_once() {
    let mut helper = CodeBuilder::module("helper.py");
    helper.load_name("print");
    helper.load_const("loading");
    helper.call_function(1);
    helper.pop_top();
    helper.load_none();
    helper.return_value();
    let registry = ModuleRegistry::new().with_module("helper", helper.build());

    let mut main = CodeBuilder::module("main.py");
    for _ in 0..2 {
        import(&mut main, "helper", 0, &[]);
        main.store_name("helper");
    }
    main.load_none();
    main.return_value();

    let mut print = CollectStringPrint::new();
    let result = Runner::new(main.build()).run_with_importer(NoLimitTracker, &mut print, &mut NoopTracer, &registry, None);
    assert_eq!(result.unwrap(), Object::None);
    assert_eq!(print.output(), "loading\n");
}

#[test]
fn missing_module_is_module_not_found() {
    let mut main = CodeBuilder::module("main.py");
    import(&mut main, "nowhere", 0, &[]);
    main.return_value();
    let err = run_with(&ModuleRegistry::new(), main.build()).unwrap_err();
    assert_eq!(err.summary(), "ModuleNotFoundError: No module named 'nowhere'");
}

#[test]
fn relative_import_from_main_has_no_parent() {
    let registry = ModuleRegistry::new().with_module("sibling", assign_module("sibling.py", "x", 1));
    let err = run_with(&registry, from_import_and_return("main.py", "sibling", 1, "x")).unwrap_err();
    assert_eq!(
        err.summary(),
        "ImportError: attempted relative import with no known parent package"
    );
}

#[test]
fn missing_name_is_import_error() {
    let registry = ModuleRegistry::new().with_module("helper", assign_module("helper.py", "value", 41));
    let err = run_with(&registry, from_import_and_return("main.py", "helper", 0, "other")).unwrap_err();
    assert_eq!(err.summary(), "ImportError: cannot import name 'other'");
}

#[test]
fn package_submodule_relative_import() {
    let mut init = CodeBuilder::module("pkg/__init__.py");
    init.load_none();
    init.return_value();
    let mut runner = CodeBuilder::module("pkg/runner.py");
    // from .sub import value; result = value
    import(&mut runner, "sub", 1, &["value"]);
    runner.import_from("value");
    runner.store_name("value");
    runner.pop_top();
    runner.load_name("value");
    runner.store_name("result");
    runner.load_none();
    runner.return_value();

    let mut registry = ModuleRegistry::new();
    registry
        .register("pkg", init.build())
        .register("pkg.sub", assign_module("pkg/sub.py", "value", 7))
        .register("pkg.runner", runner.build());

    // import pkg.runner; pkg.runner.result
    let mut main = CodeBuilder::module("main.py");
    import(&mut main, "pkg.runner", 0, &[]);
    main.store_name("pkg");
    main.load_name("pkg");
    main.load_attr("runner");
    main.load_attr("result");
    main.return_value();

    let result = run_with(&registry, main.build());
    assert_eq!(result.unwrap(), Object::Int(7));
}

#[test]
fn sys_modules_lists_imported_modules() {
    let registry = ModuleRegistry::new().with_module("helper", assign_module("helper.py", "value", 41));
    let mut main = CodeBuilder::module("main.py");
    import(&mut main, "helper", 0, &[]);
    main.pop_top();
    import(&mut main, "sys", 0, &[]);
    main.load_attr("modules");
    main.load_const("helper");
    main.emit(Opcode::BinarySubscr);
    main.load_attr("value");
    main.return_value();
    let result = run_with(&registry, main.build());
    assert_eq!(result.unwrap(), Object::Int(41));
}
