//! `iter()`, `next()`, `min()`, `max()` and `sum()`.

use super::{one_arg, unpack_args};
use crate::{
    bytecode::vm::{CallArgs, Next, VM},
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    ops::{self, BinaryOp},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::GenKind,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn builtin_iter(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let iterable = one_arg(self.heap, "iter", args)?;
        let iter = self.get_iter(&iterable);
        iterable.drop_with_heap(self.heap);
        iter
    }

    /// `next(iterator[, default])`.
    pub(super) fn builtin_next(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let args = unpack_args(self.heap, "next", args, 1, 2)?;
        let mut args = args.into_iter();
        let iter = args.next().unwrap_or_default();
        let default = args.next();
        let is_iterator = iter.ref_id().is_some_and(|id| match self.heap.get(id) {
            HeapData::Generator(generator) => generator.kind == GenKind::Generator,
            HeapData::Iter(_)
            | HeapData::CoroutineWrapper(_)
            | HeapData::AsyncGenAwaitable(_)
            | HeapData::AIterWrapper(_) => true,
            _ => false,
        });
        if !is_iterator {
            let msg = format!("'{}' object is not an iterator", iter.type_name(self.heap));
            [Some(iter), default].drop_with_heap(self.heap);
            return Err(ExcType::type_error(msg));
        }
        let next = self.send_value(&iter, Value::None);
        iter.drop_with_heap(self.heap);
        match (next, default) {
            (Ok(Next::Done(value)), Some(default)) => {
                value.drop_with_heap(self.heap);
                Ok(default)
            }
            (Ok(next), default) => {
                default.drop_with_heap(self.heap);
                self.next_to_result(next)
            }
            (Err(e), Some(default)) if e.matches(ExcType::StopIteration, self.heap) => {
                e.drop_with_heap(self.heap);
                Ok(default)
            }
            (Err(e), default) => {
                default.drop_with_heap(self.heap);
                Err(e)
            }
        }
    }

    /// `min()`/`max()` over an iterable or over two or more arguments, with the
    /// optional `key` and `default` keywords.
    pub(super) fn builtin_min_max(&mut self, call: CallArgs, is_min: bool) -> RunResult<Value> {
        let name = if is_min { "min" } else { "max" };
        let CallArgs { args, kwargs } = call;
        let mut key_func = None;
        let mut default = None;
        let mut failure = None;
        for (key, value) in kwargs {
            match key.as_str(self.heap) {
                Some("key") if failure.is_none() => key_func = Some(value),
                Some("default") if failure.is_none() => default = Some(value),
                other => {
                    if failure.is_none() {
                        failure = Some(ExcType::type_error(match other {
                            Some(other) => format!("'{other}' is an invalid keyword argument for this function"),
                            None => format!("{name}() keywords must be strings"),
                        }));
                    }
                    value.drop_with_heap(self.heap);
                }
            }
            key.drop_with_heap(self.heap);
        }
        let key_func = key_func.filter(|k| !k.is_none());
        if failure.is_none() {
            failure = match args.len() {
                0 => Some(ExcType::type_error(format!("{name} expected 1 arguments, got 0"))),
                1 => None,
                _ if default.is_some() => Some(ExcType::type_error(format!(
                    "Cannot specify a default for {name}() with multiple positional arguments"
                ))),
                _ => None,
            };
        }
        if let Some(err) = failure {
            [key_func, default].drop_with_heap(self.heap);
            args.drop_with_heap(self.heap);
            return Err(err);
        }

        let items = if args.len() == 1 {
            let iterable = args.into_iter().next().unwrap_or_default();
            match self.collect_iterable(iterable) {
                Ok(items) => items,
                Err(e) => {
                    [key_func, default].drop_with_heap(self.heap);
                    return Err(e);
                }
            }
        } else {
            args
        };
        let result = self.select_extreme(items, key_func.as_ref(), is_min);
        key_func.drop_with_heap(self.heap);
        match result {
            Ok(Some(best)) => {
                default.drop_with_heap(self.heap);
                Ok(best)
            }
            Ok(None) => default.ok_or_else(|| ExcType::value_error(format!("{name}() arg is an empty sequence"))),
            Err(e) => {
                default.drop_with_heap(self.heap);
                Err(e)
            }
        }
    }

    /// The first smallest (or largest) item, comparing `key(item)` when a key is given.
    fn select_extreme(&mut self, items: Vec<Value>, key_func: Option<&Value>, is_min: bool) -> RunResult<Option<Value>> {
        let mut best: Option<(Value, Value)> = None;
        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            let item_key = match key_func {
                Some(func) => {
                    let arg = item.clone_with_heap(self.heap);
                    match self.call_value(func, CallArgs::positional(vec![arg])) {
                        Ok(k) => k,
                        Err(e) => {
                            item.drop_with_heap(self.heap);
                            items.collect::<Vec<_>>().drop_with_heap(self.heap);
                            best.drop_with_heap(self.heap);
                            return Err(e);
                        }
                    }
                }
                None => item.clone_with_heap(self.heap),
            };
            let Some((best_item, best_key)) = best.take() else {
                best = Some((item, item_key));
                continue;
            };
            let replace = match item_key.py_partial_cmp(&best_key, self.heap) {
                Some(ordering) => ordering == if is_min { std::cmp::Ordering::Less } else { std::cmp::Ordering::Greater },
                None => {
                    let op = if is_min { "<" } else { ">" };
                    let err =
                        ExcType::type_error_unorderable(op, item_key.type_name(self.heap), best_key.type_name(self.heap));
                    [item, item_key, best_item, best_key].drop_with_heap(self.heap);
                    items.collect::<Vec<_>>().drop_with_heap(self.heap);
                    return Err(err);
                }
            };
            best = Some(if replace {
                [best_item, best_key].drop_with_heap(self.heap);
                (item, item_key)
            } else {
                [item, item_key].drop_with_heap(self.heap);
                (best_item, best_key)
            });
        }
        Ok(best.map(|(item, key)| {
            key.drop_with_heap(self.heap);
            item
        }))
    }

    /// `sum(iterable, start=0)`.
    pub(super) fn builtin_sum(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let args = unpack_args(self.heap, "sum", args, 1, 2)?;
        let mut args = args.into_iter();
        let iterable = args.next().unwrap_or_default();
        let start = args.next().unwrap_or(Value::Int(0));
        if start.is_str(self.heap) {
            [iterable, start].drop_with_heap(self.heap);
            return Err(ExcType::type_error("sum() can't sum strings [use ''.join(seq) instead]"));
        }
        let items = match self.collect_iterable(iterable) {
            Ok(items) => items,
            Err(e) => {
                start.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let mut total = start;
        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            let next = ops::binary_op(self.heap, BinaryOp::Add, &total, &item, false);
            [total, item].drop_with_heap(self.heap);
            match next {
                Ok(value) => total = value,
                Err(e) => {
                    items.collect::<Vec<_>>().drop_with_heap(self.heap);
                    return Err(e);
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, Exception, Object, Opcode, Runner};

    fn call_builtin(name: &str, build_args: impl FnOnce(&mut CodeBuilder) -> u32) -> Result<Object, Exception> {
        let mut b = CodeBuilder::module("<test>");
        b.load_name(name);
        let argc = build_args(&mut b);
        b.call_function(argc);
        b.return_value();
        Runner::new(b.build()).run_no_limits()
    }

    fn list(b: &mut CodeBuilder, items: &[i64]) {
        for &i in items {
            b.load_const(i);
        }
        b.emit_arg(Opcode::BuildList, u32::try_from(items.len()).unwrap());
    }

    #[test]
    fn min_and_max_over_iterables_and_arguments() {
        let result = call_builtin("max", |b| {
            list(b, &[3, 9, 2]);
            1
        });
        assert_eq!(result.unwrap(), Object::Int(9));
        let result = call_builtin("min", |b| {
            b.load_const(4);
            b.load_const(-1);
            b.load_const(7);
            3
        });
        assert_eq!(result.unwrap(), Object::Int(-1));
    }

    #[test]
    fn max_of_empty_sequence_is_value_error() {
        let err = call_builtin("max", |b| {
            list(b, &[]);
            1
        })
        .unwrap_err();
        assert_eq!(err.summary(), "ValueError: max() arg is an empty sequence");
    }

    #[test]
    fn sum_with_start_and_string_rejection() {
        let result = call_builtin("sum", |b| {
            list(b, &[1, 2, 3]);
            b.load_const(10);
            2
        });
        assert_eq!(result.unwrap(), Object::Int(16));
        let err = call_builtin("sum", |b| {
            list(b, &[]);
            b.load_const("");
            2
        })
        .unwrap_err();
        assert_eq!(
            err.summary(),
            "TypeError: sum() can't sum strings [use ''.join(seq) instead]"
        );
    }

    #[test]
    fn next_on_list_is_type_error() {
        let err = call_builtin("next", |b| {
            list(b, &[1]);
            1
        })
        .unwrap_err();
        assert_eq!(err.summary(), "TypeError: 'list' object is not an iterator");
    }
}
