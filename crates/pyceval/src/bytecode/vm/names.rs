//! Name resolution: locals, globals, builtins, fast slots and closure cells,
//! plus the import opcodes.

use crate::{
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Dict, HashKey, dict_get_item, dict_set_item},
    value::Value,
};

use super::{Frame, VM};

fn name_at(frame: &Frame, index: usize) -> RunResult<&str> {
    frame
        .code
        .names
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| RunError::internal("name index out of range"))
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Removes `name` from the dict `dict`, returning whether it was present.
    pub(crate) fn dict_remove_str(&mut self, dict: HeapId, name: &str) -> bool {
        let removed = match self.heap.get_mut(dict) {
            HeapData::Dict(d) => d.remove(&HashKey::str(name)),
            _ => None,
        };
        let found = removed.is_some();
        if let Some((key, value)) = removed {
            key.drop_with_heap(self.heap);
            value.drop_with_heap(self.heap);
        }
        found
    }

    pub(crate) fn dict_store_str(&mut self, dict: HeapId, name: &str, value: Value) -> RunResult<()> {
        let key = match self.heap.alloc_str(name) {
            Ok(key) => key,
            Err(e) => {
                value.drop_with_heap(self.heap);
                return Err(e.into());
            }
        };
        dict_set_item(self.heap, dict, key, value)
    }

    // ========================================================================
    // *_NAME
    // ========================================================================

    /// `LOAD_NAME`: locals, then globals, then builtins.
    pub(super) fn load_name(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let name = name_at(frame, index)?;
        let Some(locals) = frame.locals_dict else {
            return Err(ExcType::system_error(format!("no locals when loading '{name}'")));
        };
        let key = HashKey::str(name);
        let found = dict_get_item(self.heap, locals, &key)
            .or_else(|| dict_get_item(self.heap, frame.globals, &key))
            .or_else(|| dict_get_item(self.heap, frame.builtins, &key));
        match found {
            Some(value) => {
                frame.push(value);
                Ok(())
            }
            None => Err(ExcType::name_error(name)),
        }
    }

    pub(super) fn store_name(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let value = frame.pop();
        let name = match name_at(frame, index) {
            Ok(name) => name.to_owned(),
            Err(e) => {
                value.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let Some(locals) = frame.locals_dict else {
            value.drop_with_heap(self.heap);
            return Err(ExcType::system_error(format!("no locals found when storing '{name}'")));
        };
        self.dict_store_str(locals, &name, value)
    }

    pub(super) fn delete_name(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let name = name_at(frame, index)?.to_owned();
        let Some(locals) = frame.locals_dict else {
            return Err(ExcType::system_error(format!("no locals when deleting '{name}'")));
        };
        if self.dict_remove_str(locals, &name) {
            Ok(())
        } else {
            Err(ExcType::name_error(&name))
        }
    }

    // ========================================================================
    // *_GLOBAL
    // ========================================================================

    /// `LOAD_GLOBAL`: globals, then builtins.
    pub(super) fn load_global(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let name = name_at(frame, index)?;
        let key = HashKey::str(name);
        let found = dict_get_item(self.heap, frame.globals, &key)
            .or_else(|| dict_get_item(self.heap, frame.builtins, &key));
        match found {
            Some(value) => {
                frame.push(value);
                Ok(())
            }
            None => Err(ExcType::name_error(name)),
        }
    }

    pub(super) fn store_global(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let value = frame.pop();
        match name_at(frame, index) {
            Ok(name) => {
                let name = name.to_owned();
                self.dict_store_str(frame.globals, &name, value)
            }
            Err(e) => {
                value.drop_with_heap(self.heap);
                Err(e)
            }
        }
    }

    pub(super) fn delete_global(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let name = name_at(frame, index)?.to_owned();
        if self.dict_remove_str(frame.globals, &name) {
            Ok(())
        } else {
            Err(ExcType::name_error(&name))
        }
    }

    // ========================================================================
    // Fast locals and cells
    // ========================================================================

    pub(super) fn load_fast(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let value = &frame.locals[index];
        if value.is_undefined() {
            return Err(ExcType::unbound_local(&frame.code.varnames[index]));
        }
        let value = value.clone_with_heap(self.heap);
        frame.push(value);
        Ok(())
    }

    pub(super) fn delete_fast(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let old = std::mem::take(&mut frame.locals[index]);
        if old.is_undefined() {
            return Err(ExcType::unbound_local(&frame.code.varnames[index]));
        }
        old.drop_with_heap(self.heap);
        Ok(())
    }

    /// The error for reading an empty cell: cell variables are locals of this
    /// frame, free variables belong to an enclosing scope.
    fn unbound_deref(frame: &Frame, index: usize) -> RunError {
        let name = frame.code.cell_name(index);
        if index < frame.code.cellvars.len() {
            ExcType::unbound_local(name)
        } else {
            ExcType::unbound_free(name)
        }
    }

    pub(super) fn load_deref(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let value = self.heap.cell_get(frame.cells[index]);
        if value.is_undefined() {
            return Err(Self::unbound_deref(frame, index));
        }
        frame.push(value);
        Ok(())
    }

    pub(super) fn delete_deref(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let cell = frame.cells[index];
        let is_empty = matches!(self.heap.get(cell), HeapData::Cell(Value::Undefined));
        if is_empty {
            return Err(Self::unbound_deref(frame, index));
        }
        self.heap.cell_set(cell, Value::Undefined);
        Ok(())
    }

    /// `LOAD_CLASSDEREF`: a class body reads a free variable, preferring a
    /// binding in the class namespace.
    pub(super) fn load_classderef(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let Some(locals) = frame.locals_dict else {
            return Err(RunError::internal("LOAD_CLASSDEREF without a locals dict"));
        };
        let name = frame.code.cell_name(index);
        if let Some(value) = dict_get_item(self.heap, locals, &HashKey::str(name)) {
            frame.push(value);
            return Ok(());
        }
        self.load_deref(frame, index)
    }

    // ========================================================================
    // Annotations
    // ========================================================================

    /// `SETUP_ANNOTATIONS`: ensures the namespace has an `__annotations__` dict.
    pub(super) fn setup_annotations(&mut self, frame: &mut Frame) -> RunResult<()> {
        let Some(locals) = frame.locals_dict else {
            return Err(ExcType::system_error("no locals found when setting up annotations"));
        };
        let present = matches!(self.heap.get(locals), HeapData::Dict(d) if d.get_str("__annotations__").is_some());
        if present {
            return Ok(());
        }
        let annotations = self.alloc(HeapData::Dict(Dict::new()))?;
        self.dict_store_str(locals, "__annotations__", annotations)
    }

    /// `STORE_ANNOTATION`: `__annotations__[name] = TOS`.
    pub(super) fn store_annotation(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let annotation = frame.pop();
        let name = match name_at(frame, index) {
            Ok(name) => name.to_owned(),
            Err(e) => {
                annotation.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let Some(locals) = frame.locals_dict else {
            annotation.drop_with_heap(self.heap);
            return Err(ExcType::system_error("no locals found when storing annotation"));
        };
        let dict = dict_get_item(self.heap, locals, &HashKey::str("__annotations__"));
        let dict_id = dict
            .as_ref()
            .and_then(Value::ref_id)
            .filter(|id| matches!(self.heap.get(*id), HeapData::Dict(_)));
        let Some(dict_id) = dict_id else {
            dict.drop_with_heap(self.heap);
            annotation.drop_with_heap(self.heap);
            return Err(SimpleException::new_msg(ExcType::NameError, "__annotations__ not found").into());
        };
        let result = self.dict_store_str(dict_id, &name, annotation);
        dict.drop_with_heap(self.heap);
        result
    }

    // ========================================================================
    // Imports
    // ========================================================================

    /// `IMPORT_NAME`: pops `fromlist` and `level`, pushes the imported module.
    pub(super) fn import_name_op(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let fromlist = frame.pop();
        let level = frame.pop();
        let name = match name_at(frame, index) {
            Ok(name) => name.to_owned(),
            Err(e) => {
                [fromlist, level].drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let import = dict_get_item(self.heap, frame.builtins, &HashKey::str("__import__"));
        let result = match import {
            None => {
                [fromlist, level].drop_with_heap(self.heap);
                Err(SimpleException::new_msg(ExcType::ImportError, "__import__ not found").into())
            }
            Some(Value::Builtin(crate::builtins::Builtins::Import)) => {
                let level = level.as_index().unwrap_or(0);
                match self.fromlist_names(fromlist) {
                    Ok(fromlist) => self.import_module(&name, Some(frame.globals), &fromlist, level),
                    Err(e) => Err(e),
                }
            }
            Some(func) => {
                let locals = frame.locals_dict.map_or(Value::None, |id| {
                    self.heap.inc_ref(id);
                    Value::Ref(id)
                });
                self.heap.inc_ref(frame.globals);
                let args = match self.heap.alloc_str(name.as_str()) {
                    Ok(name) => vec![name, Value::Ref(frame.globals), locals, fromlist, level],
                    Err(e) => {
                        [Value::Ref(frame.globals), locals, fromlist, level, func].drop_with_heap(self.heap);
                        return Err(e.into());
                    }
                };
                let result = self.call_value(&func, super::CallArgs::positional(args));
                func.drop_with_heap(self.heap);
                result
            }
        };
        frame.push(result?);
        Ok(())
    }

    /// `IMPORT_FROM`: reads `name` from the module on TOS, falling back to the
    /// `package.name` entry of `sys.modules`.
    pub(super) fn import_from_op(&mut self, frame: &mut Frame, index: usize) -> RunResult<()> {
        let name = name_at(frame, index)?.to_owned();
        let module = frame.top().clone_with_heap(self.heap);
        let result = self.load_attr(&module, &name);
        let value = match result {
            Ok(value) => value,
            Err(e) if e.matches(ExcType::AttributeError, self.heap) => {
                e.drop_with_heap(self.heap);
                let package = match module.ref_id().map(|id| self.heap.get(id)) {
                    Some(HeapData::Module(m)) => Some(m.name.clone()),
                    _ => None,
                };
                let submodule = package.and_then(|pkg| {
                    dict_get_item(self.heap, self.modules, &HashKey::str(&format!("{pkg}.{name}")))
                });
                match submodule {
                    Some(value) => value,
                    None => {
                        module.drop_with_heap(self.heap);
                        return Err(SimpleException::new_msg(
                            ExcType::ImportError,
                            format!("cannot import name '{name}'"),
                        )
                        .into());
                    }
                }
            }
            Err(e) => {
                module.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        module.drop_with_heap(self.heap);
        frame.push(value);
        Ok(())
    }

    /// `IMPORT_STAR`: copies the module's public names into the local namespace.
    ///
    /// Uses `__all__` when the module defines it, otherwise every name that does
    /// not start with an underscore.
    pub(super) fn import_star_op(&mut self, frame: &mut Frame) -> RunResult<()> {
        let module = frame.pop();
        let Some(locals) = frame.locals_dict else {
            module.drop_with_heap(self.heap);
            return Err(ExcType::system_error("no locals found during 'import *'"));
        };
        let dict = match module.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Module(m)) => Some(m.dict),
            _ => None,
        };
        let Some(dict) = dict else {
            let type_name = module.type_name(self.heap);
            module.drop_with_heap(self.heap);
            return Err(ExcType::attribute_error(type_name, "__dict__"));
        };
        let names = self.public_names(dict);
        let result = match names {
            Ok(names) => self.copy_names(dict, locals, &names),
            Err(e) => Err(e),
        };
        module.drop_with_heap(self.heap);
        result
    }

    /// `__all__` if present, else the non-underscore keys of `dict`.
    fn public_names(&mut self, dict: HeapId) -> RunResult<Vec<String>> {
        match dict_get_item(self.heap, dict, &HashKey::str("__all__")) {
            Some(all) => {
                let items = self.collect_iterable(all)?;
                let names: Option<Vec<String>> = items
                    .iter()
                    .map(|item| item.as_str(self.heap).map(str::to_owned))
                    .collect();
                let bad_type = items
                    .iter()
                    .find(|item| !item.is_str(self.heap))
                    .map(|item| item.type_name(self.heap));
                items.drop_with_heap(self.heap);
                names.ok_or_else(|| {
                    ExcType::type_error(format!(
                        "Item in module.__all__ must be str, not {}",
                        bad_type.unwrap_or("object")
                    ))
                })
            }
            None => Ok(match self.heap.get(dict) {
                HeapData::Dict(d) => d.str_keys().into_iter().filter(|k| !k.starts_with('_')).collect(),
                _ => Vec::new(),
            }),
        }
    }

    fn copy_names(&mut self, from: HeapId, to: HeapId, names: &[String]) -> RunResult<()> {
        for name in names {
            let Some(value) = dict_get_item(self.heap, from, &HashKey::str(name)) else {
                return Err(ExcType::attribute_error("module", name));
            };
            self.dict_store_str(to, name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, Exception, Object, Runner};

    fn run(build: impl FnOnce(&mut CodeBuilder)) -> Result<Object, Exception> {
        let mut b = CodeBuilder::module("<test>");
        build(&mut b);
        Runner::new(b.build()).run_no_limits()
    }

    #[test]
    fn load_name_falls_back_to_builtins() {
        let result = run(|b| {
            b.load_name("len");
            b.load_const("abc");
            b.call_function(1);
            b.return_value();
        });
        assert_eq!(result.unwrap(), Object::Int(3));
    }

    #[test]
    fn undefined_name_is_name_error() {
        let err = run(|b| {
            b.load_name("missing");
            b.return_value();
        })
        .unwrap_err();
        assert_eq!(err.summary(), "NameError: name 'missing' is not defined");
    }

    #[test]
    fn unbound_fast_local_is_unbound_local_error() {
        let mut f = CodeBuilder::function("f").locals(&["x"]);
        f.load_fast("x");
        f.return_value();
        let err = run(|b| {
            b.make_function(f.build(), 0);
            b.call_function(0);
            b.return_value();
        })
        .unwrap_err();
        assert_eq!(
            err.summary(),
            "UnboundLocalError: local variable 'x' referenced before assignment"
        );
    }

    #[test]
    fn annotations_are_collected_in_namespace() {
        let result = run(|b| {
            b.emit(crate::Opcode::SetupAnnotations);
            b.load_name("int");
            let idx = b.name_index("x");
            b.emit_arg(crate::Opcode::StoreAnnotation, idx);
            b.load_name("__annotations__");
            b.return_value();
        });
        assert_eq!(result.unwrap().to_string(), "{'x': <class 'int'>}");
    }
}
