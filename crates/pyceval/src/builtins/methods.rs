//! Native methods of `list`, `dict` and `str`.

use super::{one_arg, unpack_args};
use crate::{
    bytecode::vm::VM,
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{HashKey, MethodKind, dict_get_item},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Calls a list, dict or str method on the borrowed `receiver`.
    pub(crate) fn call_container_method(&mut self, method: MethodKind, receiver: &Value, args: Vec<Value>) -> RunResult<Value> {
        let Some(id) = receiver.ref_id() else {
            args.drop_with_heap(self.heap);
            return Err(RunError::internal("container method called on an immediate value"));
        };
        match method {
            MethodKind::ListAppend => {
                let item = one_arg(self.heap, "append", args)?;
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.push(item);
                } else {
                    item.drop_with_heap(self.heap);
                }
                Ok(Value::None)
            }
            MethodKind::ListPop => self.list_pop(id, args),
            MethodKind::ListExtend => {
                let iterable = one_arg(self.heap, "extend", args)?;
                let items = self.collect_iterable(iterable)?;
                if let HeapData::List(list) = self.heap.get_mut(id) {
                    list.extend(items);
                } else {
                    items.drop_with_heap(self.heap);
                }
                Ok(Value::None)
            }
            MethodKind::DictKeys | MethodKind::DictItems | MethodKind::DictValues => {
                let name: &'static str = method.into();
                no_args(self.heap, name, args)?;
                self.dict_view(id, method)
            }
            MethodKind::DictGet => {
                let args = unpack_args(self.heap, "get", args, 1, 2)?;
                let mut args = args.into_iter();
                let key = args.next().unwrap_or_default();
                let default = args.next().unwrap_or(Value::None);
                let hash = HashKey::from_value(&key, self.heap);
                key.drop_with_heap(self.heap);
                let hash = match hash {
                    Ok(hash) => hash,
                    Err(e) => {
                        default.drop_with_heap(self.heap);
                        return Err(e);
                    }
                };
                match dict_get_item(self.heap, id, &hash) {
                    Some(found) => {
                        default.drop_with_heap(self.heap);
                        Ok(found)
                    }
                    None => Ok(default),
                }
            }
            MethodKind::StrJoin => {
                let iterable = one_arg(self.heap, "join", args)?;
                let items = self.collect_iterable(iterable)?;
                let joined = self.str_join(id, &items);
                items.drop_with_heap(self.heap);
                Ok(self.heap.alloc_str(joined?)?)
            }
            _ => {
                args.drop_with_heap(self.heap);
                Err(RunError::internal("not a container method"))
            }
        }
    }

    /// `list.pop([index])`.
    fn list_pop(&mut self, id: HeapId, args: Vec<Value>) -> RunResult<Value> {
        let args = unpack_args(self.heap, "pop", args, 0, 1)?;
        let index = match args.first() {
            None => -1,
            Some(arg) => match arg.as_index() {
                Some(index) => index,
                None => {
                    let msg = format!("'{}' object cannot be interpreted as an integer", arg.type_name(self.heap));
                    args.drop_with_heap(self.heap);
                    return Err(ExcType::type_error(msg));
                }
            },
        };
        args.drop_with_heap(self.heap);
        let HeapData::List(items) = self.heap.get_mut(id) else {
            return Err(RunError::internal("list.pop on a non-list"));
        };
        if items.is_empty() {
            return Err(ExcType::index_error("pop from empty list"));
        }
        let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
        let resolved = if index < 0 { index + len } else { index };
        match usize::try_from(resolved).ok().filter(|&i| i < items.len()) {
            Some(i) => Ok(items.remove(i)),
            None => Err(ExcType::index_error("pop index out of range")),
        }
    }

    /// `dict.keys()`, `dict.values()` or `dict.items()` as a new list.
    fn dict_view(&mut self, id: HeapId, method: MethodKind) -> RunResult<Value> {
        let HeapData::Dict(dict) = self.heap.get(id) else {
            return Err(RunError::internal("dict view on a non-dict"));
        };
        let flat: Vec<Value> = match method {
            MethodKind::DictKeys => dict.iter().map(|(k, _)| k.copy_for_extend()).collect(),
            MethodKind::DictValues => dict.iter().map(|(_, v)| v.copy_for_extend()).collect(),
            _ => dict
                .iter()
                .flat_map(|(k, v)| [k.copy_for_extend(), v.copy_for_extend()])
                .collect(),
        };
        self.heap.inc_ref_values(&flat);
        if method != MethodKind::DictItems {
            return Ok(self.heap.alloc_list(flat)?);
        }
        let mut items = Vec::with_capacity(flat.len() / 2);
        let mut flat = flat.into_iter();
        while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
            match self.heap.alloc_tuple(vec![key, value]) {
                Ok(pair) => items.push(pair),
                Err(e) => {
                    flat.collect::<Vec<_>>().drop_with_heap(self.heap);
                    items.drop_with_heap(self.heap);
                    return Err(e.into());
                }
            }
        }
        Ok(self.heap.alloc_list(items)?)
    }

    fn str_join(&self, sep_id: HeapId, items: &[Value]) -> RunResult<String> {
        let HeapData::Str(sep) = self.heap.get(sep_id) else {
            return Err(RunError::internal("str.join on a non-str"));
        };
        let mut out = String::new();
        for (i, item) in items.iter().enumerate() {
            let Some(text) = item.as_str(self.heap) else {
                return Err(ExcType::type_error(format!(
                    "sequence item {i}: expected str instance, {} found",
                    item.type_name(self.heap)
                )));
            };
            if i > 0 {
                out.push_str(sep);
            }
            out.push_str(text);
        }
        Ok(out)
    }
}

fn no_args(heap: &mut crate::heap::Heap<impl ResourceTracker>, name: &str, args: Vec<Value>) -> RunResult<()> {
    if args.is_empty() {
        return Ok(());
    }
    let given = args.len();
    args.drop_with_heap(heap);
    Err(ExcType::type_error(format!("{name}() takes no arguments ({given} given)")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, Const, Exception, Object, Opcode, Runner};

    /// Evaluates `receiver.method(*args)` where the receiver is built by `receiver`.
    fn call_on(receiver: impl FnOnce(&mut CodeBuilder), method: &str, args: &[Const]) -> Result<Object, Exception> {
        let mut b = CodeBuilder::module("<test>");
        receiver(&mut b);
        b.load_attr(method);
        for arg in args {
            b.load_const(arg.clone());
        }
        b.call_function(u32::try_from(args.len()).unwrap());
        b.return_value();
        Runner::new(b.build()).run_no_limits()
    }

    fn list_123(b: &mut CodeBuilder) {
        for i in 1..=3 {
            b.load_const(i);
        }
        b.emit_arg(Opcode::BuildList, 3);
    }

    fn dict_ab(b: &mut CodeBuilder) {
        b.load_const(1);
        b.load_const(2);
        b.load_const(Const::Tuple(vec!["a".into(), "b".into()]));
        b.emit_arg(Opcode::BuildConstKeyMap, 2);
    }

    #[test]
    fn list_pop_indices() {
        assert_eq!(call_on(list_123, "pop", &[]).unwrap(), Object::Int(3));
        assert_eq!(call_on(list_123, "pop", &[Const::Int(-3)]).unwrap(), Object::Int(1));
        let err = call_on(list_123, "pop", &[Const::Int(3)]).unwrap_err();
        assert_eq!(err.summary(), "IndexError: pop index out of range");
    }

    #[test]
    fn dict_views_and_get() {
        assert_eq!(call_on(dict_ab, "items", &[]).unwrap().to_string(), "[('a', 1), ('b', 2)]");
        assert_eq!(call_on(dict_ab, "values", &[]).unwrap().to_string(), "[1, 2]");
        assert_eq!(call_on(dict_ab, "get", &["b".into()]).unwrap(), Object::Int(2));
        assert_eq!(call_on(dict_ab, "get", &["z".into(), Const::Int(0)]).unwrap(), Object::Int(0));
    }

    #[test]
    fn str_join_requires_strings() {
        let joined = call_on(|b| b.load_const(", "), "join", &[Const::Tuple(vec!["x".into(), "y".into()])]);
        assert_eq!(joined.unwrap(), Object::Str("x, y".to_owned()));
        let err = call_on(|b| b.load_const(""), "join", &[Const::Tuple(vec![Const::Int(1)])]).unwrap_err();
        assert_eq!(err.summary(), "TypeError: sequence item 0: expected str instance, int found");
    }
}
