//! Container constructors and `len()`.

use super::{at_most, one_arg, unpack_args};
use crate::{
    bytecode::vm::{CallArgs, VM},
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    io::PrintWriter,
    ops,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Dict, Range, Set, dict_set_item},
    value::Value,
};

pub(super) fn builtin_len(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let value = one_arg(heap, "len", args)?;
    let len = ops::len(heap, &value);
    value.drop_with_heap(heap);
    let len = len?;
    Ok(Value::Int(i64::try_from(len).map_err(|_| ExcType::overflow("len() is too large"))?))
}

/// `range(stop)`, `range(start, stop[, step])`.
pub(super) fn builtin_range(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let args = unpack_args(heap, "range", args, 1, 3)?;
    let bounds: Result<Vec<i64>, &'static str> = args
        .iter()
        .map(|arg| arg.as_index().ok_or_else(|| arg.type_name(heap)))
        .collect();
    args.drop_with_heap(heap);
    let bounds = bounds.map_err(|type_name| {
        ExcType::type_error(format!("'{type_name}' object cannot be interpreted as an integer"))
    })?;
    let range = match bounds.as_slice() {
        [stop] => Range::new(0, *stop, 1)?,
        [start, stop] => Range::new(*start, *stop, 1)?,
        [start, stop, step] => Range::new(*start, *stop, *step)?,
        _ => unreachable!("unpack_args checked the arity"),
    };
    Ok(Value::Ref(heap.allocate(HeapData::Range(range))?))
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn builtin_list(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let args = at_most(self.heap, "list", args, 1)?;
        let items = match args.into_iter().next() {
            Some(iterable) => self.collect_iterable(iterable)?,
            None => Vec::new(),
        };
        Ok(self.heap.alloc_list(items)?)
    }

    pub(super) fn builtin_tuple(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let args = at_most(self.heap, "tuple", args, 1)?;
        let Some(iterable) = args.into_iter().next() else {
            return Ok(self.heap.alloc_tuple(Vec::new())?);
        };
        if iterable
            .ref_id()
            .is_some_and(|id| matches!(self.heap.get(id), HeapData::Tuple(_)))
        {
            return Ok(iterable);
        }
        let items = self.collect_iterable(iterable)?;
        Ok(self.heap.alloc_tuple(items)?)
    }

    pub(super) fn builtin_set(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let args = at_most(self.heap, "set", args, 1)?;
        let items = match args.into_iter().next() {
            Some(iterable) => self.collect_iterable(iterable)?,
            None => Vec::new(),
        };
        let mut set = Set::new();
        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            match item.hash_key(self.heap) {
                Ok(hash) => {
                    if let Some(duplicate) = set.insert(hash, item) {
                        duplicate.drop_with_heap(self.heap);
                    }
                }
                Err(e) => {
                    item.drop_with_heap(self.heap);
                    items.collect::<Vec<_>>().drop_with_heap(self.heap);
                    set.drop_with_heap(self.heap);
                    return Err(e);
                }
            }
        }
        self.alloc(HeapData::Set(set))
    }

    /// `dict(mapping_or_pairs=(), **kwargs)`.
    pub(super) fn builtin_dict(&mut self, call: CallArgs) -> RunResult<Value> {
        let CallArgs { args, kwargs } = call;
        let args = match at_most(self.heap, "dict", args, 1) {
            Ok(args) => args,
            Err(e) => {
                kwargs.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let id = match self.heap.allocate(HeapData::Dict(Dict::new())) {
            Ok(id) => id,
            Err(e) => {
                args.drop_with_heap(self.heap);
                kwargs.drop_with_heap(self.heap);
                return Err(e.into());
            }
        };
        let mut pairs = match args.into_iter().next() {
            Some(source) => match self.dict_source_pairs(source) {
                Ok(pairs) => pairs,
                Err(e) => {
                    kwargs.drop_with_heap(self.heap);
                    self.heap.dec_ref(id);
                    return Err(e);
                }
            },
            None => Vec::new(),
        };
        pairs.extend(kwargs);
        let mut pairs = pairs.into_iter();
        while let Some((key, value)) = pairs.next() {
            if let Err(e) = dict_set_item(self.heap, id, key, value) {
                pairs.collect::<Vec<_>>().drop_with_heap(self.heap);
                self.heap.dec_ref(id);
                return Err(e);
            }
        }
        Ok(Value::Ref(id))
    }

    /// Key/value pairs from a dict or an iterable of 2-item sequences.
    fn dict_source_pairs(&mut self, source: Value) -> RunResult<Vec<(Value, Value)>> {
        if let Some(id) = source.ref_id()
            && let HeapData::Dict(d) = self.heap.get(id)
        {
            let pairs: Vec<(Value, Value)> = d.iter().map(|(k, v)| (k.copy_for_extend(), v.copy_for_extend())).collect();
            for (k, v) in &pairs {
                for id in [k.ref_id(), v.ref_id()].into_iter().flatten() {
                    self.heap.inc_ref(id);
                }
            }
            source.drop_with_heap(self.heap);
            return Ok(pairs);
        }
        let items = self.collect_iterable(source)?;
        let mut pairs = Vec::with_capacity(items.len());
        let mut items = items.into_iter().enumerate();
        while let Some((index, item)) = items.next() {
            let element = item.ref_id().and_then(|id| self.heap.sequence_items(id));
            let failure = match element {
                Some(mut kv) if kv.len() == 2 => {
                    let value = kv.pop().unwrap_or_default();
                    let key = kv.pop().unwrap_or_default();
                    pairs.push((key, value));
                    None
                }
                Some(kv) => {
                    let len = kv.len();
                    kv.drop_with_heap(self.heap);
                    Some(ExcType::value_error(format!(
                        "dictionary update sequence element #{index} has length {len}; 2 is required"
                    )))
                }
                None => Some(ExcType::type_error(format!(
                    "cannot convert dictionary update sequence element #{index} to a sequence"
                ))),
            };
            item.drop_with_heap(self.heap);
            if let Some(err) = failure {
                items.map(|(_, item)| item).collect::<Vec<_>>().drop_with_heap(self.heap);
                pairs.drop_with_heap(self.heap);
                return Err(err);
            }
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{builtin_len, builtin_range};
    use crate::{
        heap::{Heap, HeapData},
        resource::NoLimitTracker,
        value::Value,
    };

    #[test]
    fn range_rejects_floats_and_zero_step() {
        let mut heap = Heap::new(16, NoLimitTracker);
        let err = builtin_range(&mut heap, vec![Value::Float(1.0)]).unwrap_err();
        assert!(format!("{err:?}").contains("'float' object cannot be interpreted as an integer"));
        let err = builtin_range(&mut heap, vec![Value::Int(0), Value::Int(5), Value::Int(0)]).unwrap_err();
        assert!(format!("{err:?}").contains("range() arg 3 must not be zero"));
        let range = builtin_range(&mut heap, vec![Value::Int(5)]).unwrap();
        let Value::Ref(id) = &range else { panic!("range is a heap object") };
        assert!(matches!(heap.get(*id), HeapData::Range(r) if r.len() == 5));
        range.drop_with_heap(&mut heap);
    }

    #[test]
    fn len_counts_characters() {
        let mut heap = Heap::new(16, NoLimitTracker);
        let s = heap.alloc_str("héllo").unwrap();
        assert_eq!(builtin_len(&mut heap, vec![s]).unwrap().as_index(), Some(5));
    }
}
