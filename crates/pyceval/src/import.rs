//! Module resolution for `IMPORT_NAME` and `__import__`.
//!
//! An [`Importer`] only answers "what is the source of module `x`". Everything
//! else lives on the VM: relative-name resolution, walking dotted names parent
//! first, the `sys.modules` cache, binding submodules on their parents and the
//! fromlist handling of `from pkg import sub`.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    builtins::{Builtins, at_most},
    bytecode::{
        Code,
        vm::{CallArgs, VM},
    },
    exception_private::{ExcType, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{HashKey, dict_get_item},
    value::Value,
};

/// Modules implemented natively by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeModule {
    /// `exc_info()`, `maxsize` and `modules`.
    Sys,
    /// `suppress`, `nullcontext` and `contextmanager`.
    Contextlib,
}

/// Where the body of a module comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// Module-level code executed once, on first import.
    Code(Rc<Code>),
    Native(NativeModule),
}

/// Resolves absolute module names to their source.
pub trait Importer {
    /// The source of `name`, or `None` when no such module exists.
    fn resolve(&self, name: &str) -> Option<ModuleSource>;

    /// Whether `name` is a package, i.e. may contain submodules.
    fn is_package(&self, _name: &str) -> bool {
        false
    }
}

/// The default importer: the native modules plus host-registered code modules.
///
/// A registered name with registered children (`pkg` alongside `pkg.sub`) is a package.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: AHashMap<String, Rc<Code>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `code` as the body of module `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, code: Code) -> &mut Self {
        self.modules.insert(name.into(), Rc::new(code));
        self
    }

    #[must_use]
    pub fn with_module(mut self, name: impl Into<String>, code: Code) -> Self {
        self.register(name, code);
        self
    }
}

impl Importer for ModuleRegistry {
    fn resolve(&self, name: &str) -> Option<ModuleSource> {
        if let Some(code) = self.modules.get(name) {
            return Some(ModuleSource::Code(Rc::clone(code)));
        }
        match name {
            "sys" => Some(ModuleSource::Native(NativeModule::Sys)),
            "contextlib" => Some(ModuleSource::Native(NativeModule::Contextlib)),
            _ => None,
        }
    }

    fn is_package(&self, name: &str) -> bool {
        self.modules
            .keys()
            .any(|key| key.strip_prefix(name).is_some_and(|rest| rest.starts_with('.')))
    }
}

fn module_not_found(name: &str) -> crate::exception_private::RunError {
    SimpleException::new_msg(ExcType::ModuleNotFoundError, format!("No module named '{name}'")).into()
}

/// Splits `a.b.c` into (`a.b`, `c`); the parent is empty for top-level names.
fn split_parent(name: &str) -> (&str, &str) {
    name.rsplit_once('.').unwrap_or(("", name))
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Imports `name` the way `IMPORT_NAME` does.
    ///
    /// Without a fromlist the top-level package is returned (`import a.b` binds `a`),
    /// with one the named module itself, after importing any submodules the
    /// fromlist names.
    pub(crate) fn import_module(
        &mut self,
        name: &str,
        globals: Option<HeapId>,
        fromlist: &[String],
        level: i64,
    ) -> RunResult<Value> {
        if level < 0 {
            return Err(ExcType::value_error("level must be >= 0"));
        }
        if level == 0 && name.is_empty() {
            return Err(ExcType::value_error("Empty module name"));
        }
        let absolute = if level > 0 {
            self.resolve_relative(name, globals, level)?
        } else {
            name.to_owned()
        };
        let module = self.import_dotted(&absolute)?;
        if !fromlist.is_empty() {
            if let Err(e) = self.handle_fromlist(&module, &absolute, fromlist) {
                module.drop_with_heap(self.heap);
                return Err(e);
            }
            return Ok(module);
        }
        let Some((first, _)) = name.split_once('.') else {
            return Ok(module);
        };
        // `import a.b.c` evaluates to `a`; relative forms cut the same suffix
        let cut_off = name.len() - first.len();
        let top = &absolute[..absolute.len() - cut_off];
        module.drop_with_heap(self.heap);
        self.cached_module(top)
            .ok_or_else(|| SimpleException::new_msg(ExcType::KeyError, format!("'{top}'")).into())
    }

    /// Resolves a relative import against `__package__` (or `__name__`) of `globals`.
    fn resolve_relative(&self, name: &str, globals: Option<HeapId>, level: i64) -> RunResult<String> {
        let package = globals.and_then(|g| match self.dict_str(g, "__package__") {
            Some(package) => Some(package),
            None => {
                let module_name = self.dict_str(g, "__name__")?;
                if self.dict_has(g, "__path__") {
                    Some(module_name)
                } else {
                    Some(split_parent(&module_name).0.to_owned())
                }
            }
        });
        let Some(package) = package.filter(|p| !p.is_empty()) else {
            return Err(SimpleException::new_msg(
                ExcType::ImportError,
                "attempted relative import with no known parent package",
            )
            .into());
        };
        let level = usize::try_from(level).unwrap_or(usize::MAX);
        let bits: Vec<&str> = package.rsplitn(level, '.').collect();
        if bits.len() < level {
            return Err(ExcType::value_error("attempted relative import beyond top-level package"));
        }
        let base = bits.last().copied().unwrap_or_default();
        Ok(if name.is_empty() {
            base.to_owned()
        } else {
            format!("{base}.{name}")
        })
    }

    /// Imports every prefix of `absolute` in order, returning the last module.
    fn import_dotted(&mut self, absolute: &str) -> RunResult<Value> {
        let mut end = 0;
        let mut module: Option<Value> = None;
        loop {
            let next_dot = absolute[end..].find('.').map(|i| end + i);
            let prefix = &absolute[..next_dot.unwrap_or(absolute.len())];
            if let Some(parent) = module.take() {
                let is_package = self.module_is_package(&parent);
                parent.drop_with_heap(self.heap);
                if !is_package && !self.dict_has(self.modules, prefix) {
                    let parent_name = split_parent(prefix).0;
                    return Err(SimpleException::new_msg(
                        ExcType::ModuleNotFoundError,
                        format!("No module named '{prefix}'; '{parent_name}' is not a package"),
                    )
                    .into());
                }
            }
            module = Some(self.load_module(prefix)?);
            match next_dot {
                Some(dot) => end = dot + 1,
                None => break,
            }
        }
        Ok(module.unwrap_or_default())
    }

    /// Loads a single module whose parent (if any) is already imported.
    fn load_module(&mut self, fullname: &str) -> RunResult<Value> {
        if let Some(module) = self.cached_module(fullname) {
            return Ok(module);
        }
        let source = self.importer.resolve(fullname).ok_or_else(|| module_not_found(fullname))?;
        let (parent, short) = split_parent(fullname);
        let dict = self.new_namespace(fullname)?;
        if self.importer.is_package(fullname) {
            let path = self.heap.alloc_list(Vec::new())?;
            self.dict_store_str(dict, "__path__", path)?;
            let package = self.heap.alloc_str(fullname)?;
            self.dict_store_str(dict, "__package__", package)?;
        } else {
            let package = self.heap.alloc_str(parent)?;
            self.dict_store_str(dict, "__package__", package)?;
        }
        let module = self.new_module(fullname, dict)?;
        let cached = module.clone_with_heap(self.heap);
        if let Err(e) = self.dict_store_str(self.modules, fullname, cached) {
            module.drop_with_heap(self.heap);
            return Err(e);
        }
        let executed = match source {
            ModuleSource::Code(code) => self.exec_code(code, dict).map(|result| result.drop_with_heap(self.heap)),
            ModuleSource::Native(native) => self.populate_native(native, dict),
        };
        if let Err(e) = executed {
            self.dict_remove_str(self.modules, fullname);
            module.drop_with_heap(self.heap);
            return Err(e);
        }
        // the module body may have replaced its own sys.modules entry
        let module = match self.cached_module(fullname) {
            Some(current) => {
                module.drop_with_heap(self.heap);
                current
            }
            None => module,
        };
        if !parent.is_empty()
            && let Some(parent_module) = self.cached_module(parent)
        {
            let parent_dict = match parent_module.ref_id().map(|id| self.heap.get(id)) {
                Some(HeapData::Module(m)) => Some(m.dict),
                _ => None,
            };
            parent_module.drop_with_heap(self.heap);
            if let Some(parent_dict) = parent_dict {
                let child = module.clone_with_heap(self.heap);
                if let Err(e) = self.dict_store_str(parent_dict, short, child) {
                    module.drop_with_heap(self.heap);
                    return Err(e);
                }
            }
        }
        Ok(module)
    }

    fn populate_native(&mut self, native: NativeModule, dict: HeapId) -> RunResult<()> {
        match native {
            NativeModule::Sys => {
                self.dict_store_str(dict, "exc_info", Value::Builtin(Builtins::ExcInfo))?;
                self.dict_store_str(dict, "maxsize", Value::Int(i64::MAX))?;
                self.heap.inc_ref(self.modules);
                self.dict_store_str(dict, "modules", Value::Ref(self.modules))
            }
            NativeModule::Contextlib => {
                for builtin in [Builtins::Suppress, Builtins::NullContext, Builtins::ContextManager] {
                    let name: &'static str = builtin.into();
                    self.dict_store_str(dict, name, Value::Builtin(builtin))?;
                }
                Ok(())
            }
        }
    }

    /// `from package import a, b`: imports `package.a` for names the package lacks.
    fn handle_fromlist(&mut self, module: &Value, module_name: &str, fromlist: &[String]) -> RunResult<()> {
        if !self.module_is_package(module) {
            return Ok(());
        }
        let Some(dict) = module_dict(self, module) else {
            return Ok(());
        };
        for item in fromlist {
            if item == "*" {
                if let Some(all) = dict_get_item(self.heap, dict, &HashKey::str("__all__")) {
                    let names = self.fromlist_names(all)?;
                    let names: Vec<String> = names.into_iter().filter(|n| n != "*").collect();
                    self.handle_fromlist(module, module_name, &names)?;
                }
                continue;
            }
            if self.dict_has(dict, item) {
                continue;
            }
            let submodule = format!("{module_name}.{item}");
            let known = self.dict_has(self.modules, &submodule) || self.importer.resolve(&submodule).is_some();
            if known {
                let imported = self.import_dotted(&submodule)?;
                imported.drop_with_heap(self.heap);
            }
        }
        Ok(())
    }

    /// Converts an `IMPORT_NAME`/`__import__` fromlist into names; falsy means empty.
    pub(crate) fn fromlist_names(&mut self, fromlist: Value) -> RunResult<Vec<String>> {
        if fromlist.is_none() || !fromlist.py_bool(self.heap) {
            fromlist.drop_with_heap(self.heap);
            return Ok(Vec::new());
        }
        let items = self.collect_iterable(fromlist)?;
        let names: Result<Vec<String>, &'static str> = items
            .iter()
            .map(|item| item.as_str(self.heap).map(str::to_owned).ok_or_else(|| item.type_name(self.heap)))
            .collect();
        items.drop_with_heap(self.heap);
        names.map_err(|type_name| ExcType::type_error(format!("Item in ``from list'' must be str, not {type_name}")))
    }

    /// `__import__(name, globals=None, locals=None, fromlist=(), level=0)`.
    pub(crate) fn builtin_import(&mut self, call: CallArgs) -> RunResult<Value> {
        const PARAMS: [&str; 5] = ["name", "globals", "locals", "fromlist", "level"];
        let CallArgs { args, kwargs } = call;
        let args = match at_most(self.heap, "__import__", args, PARAMS.len()) {
            Ok(args) => args,
            Err(e) => {
                kwargs.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let mut slots: [Option<Value>; 5] = Default::default();
        for (slot, arg) in slots.iter_mut().zip(args) {
            *slot = Some(arg);
        }
        let mut failure = None;
        for (key, value) in kwargs {
            let position = key.as_str(self.heap).map(|k| (k.to_owned(), PARAMS.iter().position(|p| *p == k)));
            key.drop_with_heap(self.heap);
            let error = match position {
                Some((_, Some(i))) if slots[i].is_none() => {
                    slots[i] = Some(value);
                    continue;
                }
                Some((k, Some(_))) => ExcType::type_error_multiple_values("__import__", &k),
                Some((k, None)) => ExcType::type_error(format!("'{k}' is an invalid keyword argument for this function")),
                None => ExcType::type_error_keywords_must_be_strings("__import__"),
            };
            value.drop_with_heap(self.heap);
            failure.get_or_insert(error);
        }
        if let Some(err) = failure {
            slots.drop_with_heap(self.heap);
            return Err(err);
        }
        let [name, globals, locals, fromlist, level] = slots;
        locals.drop_with_heap(self.heap);
        let result = self.import_with_values(name, globals.as_ref(), fromlist, level);
        globals.drop_with_heap(self.heap);
        result
    }

    fn import_with_values(
        &mut self,
        name: Option<Value>,
        globals: Option<&Value>,
        fromlist: Option<Value>,
        level: Option<Value>,
    ) -> RunResult<Value> {
        let name_text = match &name {
            None => Err(ExcType::type_error(
                "__import__() missing required argument 'name' (pos 1)",
            )),
            Some(value) => value.as_str(self.heap).map(str::to_owned).ok_or_else(|| {
                ExcType::type_error(format!(
                    "__import__() argument 1 must be str, not {}",
                    value.type_name(self.heap)
                ))
            }),
        };
        let level_num = match &level {
            None => Ok(0),
            Some(value) => value.as_index().ok_or_else(|| {
                ExcType::type_error(format!(
                    "an integer is required (got type {})",
                    value.type_name(self.heap)
                ))
            }),
        };
        [name, level].drop_with_heap(self.heap);
        let (name_text, level_num) = match (name_text, level_num) {
            (Ok(name), Ok(level)) => (name, level),
            (Err(e), _) | (_, Err(e)) => {
                fromlist.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let fromlist = self.fromlist_names(fromlist.unwrap_or(Value::None))?;
        let globals = globals
            .and_then(Value::ref_id)
            .filter(|id| matches!(self.heap.get(*id), HeapData::Dict(_)));
        self.import_module(&name_text, globals, &fromlist, level_num)
    }

    /// `sys.modules[name]` as a new reference.
    fn cached_module(&mut self, name: &str) -> Option<Value> {
        dict_get_item(self.heap, self.modules, &HashKey::str(name))
    }

    fn module_is_package(&mut self, module: &Value) -> bool {
        module_dict(self, module).is_some_and(|dict| self.dict_has(dict, "__path__"))
    }

    fn dict_has(&self, dict: HeapId, name: &str) -> bool {
        matches!(self.heap.get(dict), HeapData::Dict(d) if d.get_str(name).is_some())
    }

    /// The string stored under `name` in `dict`, if it is one.
    fn dict_str(&self, dict: HeapId, name: &str) -> Option<String> {
        match self.heap.get(dict) {
            HeapData::Dict(d) => d.get_str(name)?.as_str(self.heap).map(str::to_owned),
            _ => None,
        }
    }
}

fn module_dict<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(vm: &VM<'_, T, P, Tr>, module: &Value) -> Option<HeapId> {
    match module.ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Module(m)) => Some(m.dict),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Importer, ModuleRegistry, split_parent};
    use crate::CodeBuilder;

    #[test]
    fn registry_detects_packages_and_natives() {
        let registry = ModuleRegistry::new()
            .with_module("pkg", CodeBuilder::module("pkg").build())
            .with_module("pkg.sub", CodeBuilder::module("pkg.sub").build());
        assert!(registry.is_package("pkg"));
        assert!(!registry.is_package("pkg.sub"));
        assert!(!registry.is_package("pk"));
        assert!(registry.resolve("sys").is_some());
        assert!(registry.resolve("contextlib").is_some());
        assert!(registry.resolve("os").is_none());
    }

    #[test]
    fn split_parent_of_dotted_names() {
        assert_eq!(split_parent("a.b.c"), ("a.b", "c"));
        assert_eq!(split_parent("a"), ("", "a"));
    }
}
