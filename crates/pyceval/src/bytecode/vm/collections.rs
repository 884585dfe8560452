//! Container construction, unpacking and iteration opcodes.

use crate::{
    bytecode::{Opcode, format_flags},
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    format,
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Dict, GenKind, Iter, IterSource, Set, Slice, dict_set_item},
    value::Value,
};

use super::{Frame, VM};

fn not_enough_values(expected: usize, got: usize) -> RunError {
    ExcType::value_error(format!("not enough values to unpack (expected {expected}, got {got})"))
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    // ========================================================================
    // Iteration
    // ========================================================================

    /// `iter(value)` as a new reference; `value` is borrowed.
    pub(crate) fn get_iter(&mut self, value: &Value) -> RunResult<Value> {
        let Some(id) = value.ref_id() else {
            return Err(ExcType::type_error_not_iterable(value.type_name(self.heap)));
        };
        let source = match self.heap.get(id) {
            HeapData::List(_) => IterSource::List(id),
            HeapData::Tuple(_) => IterSource::Tuple(id),
            HeapData::Str(_) => IterSource::Str(id),
            HeapData::Dict(_) => IterSource::Dict(id),
            HeapData::Set(_) => IterSource::Set(id),
            HeapData::Range(range) => IterSource::Range(*range),
            HeapData::Iter(_)
            | HeapData::CoroutineWrapper(_)
            | HeapData::AsyncGenAwaitable(_)
            | HeapData::AIterWrapper(_) => return Ok(value.clone_with_heap(self.heap)),
            HeapData::Generator(generator) if generator.kind == GenKind::Generator => {
                return Ok(value.clone_with_heap(self.heap));
            }
            _ => return Err(ExcType::type_error_not_iterable(value.type_name(self.heap))),
        };
        if !matches!(source, IterSource::Range(_)) {
            self.heap.inc_ref(id);
        }
        let iter = Iter::new(source, self.heap);
        self.alloc(HeapData::Iter(iter))
    }

    /// Drains `iterable` into a vector of owned values, consuming it.
    pub(crate) fn collect_iterable(&mut self, iterable: Value) -> RunResult<Vec<Value>> {
        if let Some(id) = iterable.ref_id()
            && let Some(items) = self.heap.sequence_items(id)
        {
            iterable.drop_with_heap(self.heap);
            return Ok(items);
        }
        let iter = self.get_iter(&iterable);
        iterable.drop_with_heap(self.heap);
        let iter = iter?;
        let mut items = Vec::new();
        let failure = loop {
            match self.iter_next_value(&iter) {
                Ok(Some(value)) => items.push(value),
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        iter.drop_with_heap(self.heap);
        match failure {
            None => Ok(items),
            Some(e) => {
                items.drop_with_heap(self.heap);
                Err(e)
            }
        }
    }

    pub(super) fn get_iter_op(&mut self, frame: &mut Frame) -> RunResult<()> {
        let iterable = frame.pop();
        let iter = self.get_iter(&iterable);
        iterable.drop_with_heap(self.heap);
        frame.push(iter?);
        Ok(())
    }

    /// `FOR_ITER`: pushes the next item, or pops the exhausted iterator and jumps.
    pub(super) fn for_iter(&mut self, frame: &mut Frame, delta: usize) -> RunResult<()> {
        match self.iter_next_value(frame.top())? {
            Some(value) => frame.push(value),
            None => {
                frame.pop().drop_with_heap(self.heap);
                frame.ip += delta;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Unpacking
    // ========================================================================

    /// `UNPACK_SEQUENCE`: pushes exactly `count` items, first item on top.
    pub(super) fn unpack_sequence(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let seq = frame.pop();
        let exact = match seq.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::List(items) | HeapData::Tuple(items)) if items.len() == count => {
                Some(items.iter().map(Value::copy_for_extend).collect::<Vec<_>>())
            }
            _ => None,
        };
        let items = if let Some(items) = exact {
            self.heap.inc_ref_values(&items);
            seq.drop_with_heap(self.heap);
            items
        } else {
            let items = self.take_items(seq, count)?;
            if items.len() < count {
                let got = items.len();
                items.drop_with_heap(self.heap);
                return Err(not_enough_values(count, got));
            }
            items
        };
        frame.stack.extend(items.into_iter().rev());
        Ok(())
    }

    /// Takes up to `count` items from `iterable`, then checks it is exhausted.
    fn take_items(&mut self, iterable: Value, count: usize) -> RunResult<Vec<Value>> {
        let iter = self.get_iter(&iterable);
        iterable.drop_with_heap(self.heap);
        let iter = iter?;
        let mut items = Vec::with_capacity(count);
        let result = loop {
            if items.len() == count {
                break match self.iter_next_value(&iter) {
                    Ok(None) => Ok(()),
                    Ok(Some(extra)) => {
                        extra.drop_with_heap(self.heap);
                        Err(ExcType::value_error(format!("too many values to unpack (expected {count})")))
                    }
                    Err(e) => Err(e),
                };
            }
            match self.iter_next_value(&iter) {
                Ok(Some(value)) => items.push(value),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        iter.drop_with_heap(self.heap);
        match result {
            Ok(()) => Ok(items),
            Err(e) => {
                items.drop_with_heap(self.heap);
                Err(e)
            }
        }
    }

    /// `UNPACK_EX`: `a, *rest, b = seq`. The low byte counts targets before the
    /// star, the next byte those after it.
    pub(super) fn unpack_ex(&mut self, frame: &mut Frame, oparg: usize) -> RunResult<()> {
        let before = oparg & 0xFF;
        let after = oparg >> 8;
        let seq = frame.pop();
        let mut items = self.collect_iterable(seq)?;
        if items.len() < before + after {
            let got = items.len();
            items.drop_with_heap(self.heap);
            return Err(ExcType::value_error(format!(
                "not enough values to unpack (expected at least {}, got {got})",
                before + after
            )));
        }
        let tail = items.split_off(items.len() - after);
        let rest = items.split_off(before);
        let rest = match self.heap.alloc_list(rest) {
            Ok(list) => list,
            Err(e) => {
                items.drop_with_heap(self.heap);
                tail.drop_with_heap(self.heap);
                return Err(e.into());
            }
        };
        frame.stack.extend(tail.into_iter().rev());
        frame.push(rest);
        frame.stack.extend(items.into_iter().rev());
        Ok(())
    }

    // ========================================================================
    // Building containers
    // ========================================================================

    /// Inserts `values` into the set at `set`, consuming them. Stops at the
    /// first unhashable value, releasing the rest.
    fn set_extend(&mut self, set: &Value, values: Vec<Value>) -> RunResult<()> {
        let Some(set_id) = set.ref_id() else {
            values.drop_with_heap(self.heap);
            return Err(RunError::internal("set_extend target is not a set"));
        };
        let mut values = values.into_iter();
        while let Some(value) = values.next() {
            let hash = match value.hash_key(self.heap) {
                Ok(hash) => hash,
                Err(e) => {
                    value.drop_with_heap(self.heap);
                    values.collect::<Vec<_>>().drop_with_heap(self.heap);
                    return Err(e);
                }
            };
            let duplicate = match self.heap.get_mut(set_id) {
                HeapData::Set(s) => s.insert(hash, value),
                _ => Some(value),
            };
            duplicate.drop_with_heap(self.heap);
        }
        Ok(())
    }

    pub(super) fn build_set(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let items = frame.pop_n(count);
        let set = match self.alloc(HeapData::Set(Set::new())) {
            Ok(set) => set,
            Err(e) => {
                items.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        if let Err(e) = self.set_extend(&set, items) {
            set.drop_with_heap(self.heap);
            return Err(e);
        }
        frame.push(set);
        Ok(())
    }

    /// Stores `pairs` into a fresh dict, later keys overwriting earlier ones.
    fn dict_from_pairs(&mut self, pairs: Vec<(Value, Value)>) -> RunResult<Value> {
        let dict = match self.heap.allocate(HeapData::Dict(Dict::with_capacity(pairs.len()))) {
            Ok(id) => id,
            Err(e) => {
                pairs.drop_with_heap(self.heap);
                return Err(e.into());
            }
        };
        let mut pairs = pairs.into_iter();
        while let Some((key, value)) = pairs.next() {
            if let Err(e) = dict_set_item(self.heap, dict, key, value) {
                pairs.collect::<Vec<_>>().drop_with_heap(self.heap);
                self.heap.dec_ref(dict);
                return Err(e);
            }
        }
        Ok(Value::Ref(dict))
    }

    pub(super) fn build_map(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let flat = frame.pop_n(2 * count);
        let mut pairs = Vec::with_capacity(count);
        let mut flat = flat.into_iter();
        while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
            pairs.push((key, value));
        }
        let dict = self.dict_from_pairs(pairs)?;
        frame.push(dict);
        Ok(())
    }

    /// `BUILD_CONST_KEY_MAP`: TOS is a tuple of keys for the `count` values below it.
    pub(super) fn build_const_key_map(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let keys = frame.pop();
        let values = frame.pop_n(count);
        let key_items = match keys.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Tuple(items)) if items.len() == count => {
                Some(items.iter().map(Value::copy_for_extend).collect::<Vec<_>>())
            }
            _ => None,
        };
        let Some(key_items) = key_items else {
            keys.drop_with_heap(self.heap);
            values.drop_with_heap(self.heap);
            return Err(ExcType::system_error("bad BUILD_CONST_KEY_MAP keys argument"));
        };
        self.heap.inc_ref_values(&key_items);
        keys.drop_with_heap(self.heap);
        let dict = self.dict_from_pairs(key_items.into_iter().zip(values).collect())?;
        frame.push(dict);
        Ok(())
    }

    /// `BUILD_STRING`: concatenates the `count` strings on top of the stack.
    pub(super) fn build_string(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let parts = frame.pop_n(count);
        let mut out = String::new();
        for part in &parts {
            out.push_str(part.as_str(self.heap).unwrap_or_default());
        }
        parts.drop_with_heap(self.heap);
        frame.push(self.heap.alloc_str(out)?);
        Ok(())
    }

    /// `BUILD_TUPLE_UNPACK`, `BUILD_TUPLE_UNPACK_WITH_CALL` and `BUILD_LIST_UNPACK`.
    pub(super) fn build_sequence_unpack(&mut self, frame: &mut Frame, op: Opcode, count: usize) -> RunResult<()> {
        let iterables = frame.pop_n(count);
        let mut items = Vec::new();
        let mut iterables = iterables.into_iter();
        while let Some(iterable) = iterables.next() {
            let type_name = iterable.type_name(self.heap);
            match self.collect_iterable(iterable) {
                Ok(more) => items.extend(more),
                Err(e) => {
                    iterables.collect::<Vec<_>>().drop_with_heap(self.heap);
                    items.drop_with_heap(self.heap);
                    if op == Opcode::BuildTupleUnpackWithCall && e.matches(ExcType::TypeError, self.heap) {
                        e.drop_with_heap(self.heap);
                        let func = self.func_label(frame.top());
                        return Err(ExcType::type_error(format!(
                            "{func} argument after * must be an iterable, not {type_name}"
                        )));
                    }
                    return Err(e);
                }
            }
        }
        let result = if op == Opcode::BuildListUnpack {
            self.heap.alloc_list(items)?
        } else {
            self.heap.alloc_tuple(items)?
        };
        frame.push(result);
        Ok(())
    }

    pub(super) fn build_set_unpack(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let iterables = frame.pop_n(count);
        let set = match self.alloc(HeapData::Set(Set::new())) {
            Ok(set) => set,
            Err(e) => {
                iterables.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        let mut iterables = iterables.into_iter();
        while let Some(iterable) = iterables.next() {
            let added = match self.collect_iterable(iterable) {
                Ok(items) => self.set_extend(&set, items),
                Err(e) => Err(e),
            };
            if let Err(e) = added {
                iterables.collect::<Vec<_>>().drop_with_heap(self.heap);
                set.drop_with_heap(self.heap);
                return Err(e);
            }
        }
        frame.push(set);
        Ok(())
    }

    /// `BUILD_MAP_UNPACK` and `BUILD_MAP_UNPACK_WITH_CALL`.
    ///
    /// The call variant reports non-mappings, non-string keys and repeated
    /// keywords against the function being called, which sits below the
    /// positional-arguments tuple.
    pub(super) fn build_map_unpack(&mut self, frame: &mut Frame, count: usize, with_call: bool) -> RunResult<()> {
        let mappings = frame.pop_n(count);
        let mut pairs: Vec<(Value, Value)> = Vec::new();
        let mut failure = None;
        for mapping in &mappings {
            let entries = match mapping.ref_id().map(|id| self.heap.get(id)) {
                Some(HeapData::Dict(d)) => d
                    .iter()
                    .map(|(k, v)| (k.copy_for_extend(), v.copy_for_extend()))
                    .collect::<Vec<_>>(),
                _ => {
                    let type_name = mapping.type_name(self.heap);
                    failure = Some(if with_call {
                        let func = self.func_label(frame.peek(2));
                        ExcType::type_error(format!("{func} argument after ** must be a mapping, not {type_name}"))
                    } else {
                        ExcType::type_error(format!("'{type_name}' object is not a mapping"))
                    });
                    break;
                }
            };
            for (key, value) in &entries {
                for v in [key, value] {
                    if let Value::Ref(id) = v {
                        self.heap.inc_ref(*id);
                    }
                }
            }
            let mut entries = entries.into_iter();
            while let Some((key, value)) = entries.next() {
                if with_call {
                    let problem = if key.as_str(self.heap).is_none() {
                        Some(format!("{} keywords must be strings", self.func_label(frame.peek(2))))
                    } else if pairs.iter().any(|(existing, _)| existing.py_eq(&key, self.heap)) {
                        Some(format!(
                            "{} got multiple values for keyword argument '{}'",
                            self.func_label(frame.peek(2)),
                            key.py_str(self.heap)
                        ))
                    } else {
                        None
                    };
                    if let Some(msg) = problem {
                        key.drop_with_heap(self.heap);
                        value.drop_with_heap(self.heap);
                        entries.collect::<Vec<_>>().drop_with_heap(self.heap);
                        failure = Some(ExcType::type_error(msg));
                        break;
                    }
                }
                pairs.push((key, value));
            }
            if failure.is_some() {
                break;
            }
        }
        mappings.drop_with_heap(self.heap);
        if let Some(e) = failure {
            pairs.drop_with_heap(self.heap);
            return Err(e);
        }
        let dict = self.dict_from_pairs(pairs)?;
        frame.push(dict);
        Ok(())
    }

    /// `BUILD_SLICE`: `start, stop[, step]`.
    pub(super) fn build_slice(&mut self, frame: &mut Frame, argc: usize) -> RunResult<()> {
        let step = if argc == 3 { frame.pop() } else { Value::None };
        let stop = frame.pop();
        let start = frame.pop();
        let slice = self.alloc(HeapData::Slice(Slice { start, stop, step }))?;
        frame.push(slice);
        Ok(())
    }

    /// `LIST_APPEND`: appends TOS to the list `depth` slots down (comprehensions).
    pub(super) fn list_append(&mut self, frame: &mut Frame, depth: usize) {
        let value = frame.pop();
        let target = frame.peek(depth).ref_id();
        match target.map(|id| self.heap.get_mut(id)) {
            Some(HeapData::List(list)) => list.push(value),
            _ => value.drop_with_heap(self.heap),
        }
    }

    pub(super) fn set_add(&mut self, frame: &mut Frame, depth: usize) -> RunResult<()> {
        let value = frame.pop();
        let set = frame.peek(depth).copy_for_extend();
        let result = self.set_extend(&set, vec![value]);
        set.forget();
        result
    }

    /// `MAP_ADD`: `map[TOS] = TOS1` for the dict `depth` slots down.
    pub(super) fn map_add(&mut self, frame: &mut Frame, depth: usize) -> RunResult<()> {
        let key = frame.pop();
        let value = frame.pop();
        match frame.peek(depth).ref_id() {
            Some(dict) => dict_set_item(self.heap, dict, key, value),
            None => {
                key.drop_with_heap(self.heap);
                value.drop_with_heap(self.heap);
                Err(RunError::internal("MAP_ADD target is not a dict"))
            }
        }
    }

    // ========================================================================
    // f-strings
    // ========================================================================

    /// `FORMAT_VALUE`: applies the optional `!s`/`!r`/`!a` conversion, then `format()`.
    pub(super) fn format_value_op(&mut self, frame: &mut Frame, flags: u32) -> RunResult<()> {
        let spec = if flags & format_flags::HAVE_SPEC == 0 {
            None
        } else {
            Some(frame.pop())
        };
        let value = frame.pop();
        let converted = match flags & format_flags::CONVERSION_MASK {
            format_flags::STR if !value.is_str(self.heap) => Some(value.py_str(self.heap)),
            format_flags::REPR => Some(value.py_repr(self.heap)),
            format_flags::ASCII => Some(format::ascii(self.heap, &value)),
            _ => None,
        };
        let value = match converted {
            Some(text) => {
                value.drop_with_heap(self.heap);
                match self.heap.alloc_str(text) {
                    Ok(v) => v,
                    Err(e) => {
                        spec.drop_with_heap(self.heap);
                        return Err(e.into());
                    }
                }
            }
            None => value,
        };
        let Some(spec) = spec else {
            if value.is_str(self.heap) {
                frame.push(value);
                return Ok(());
            }
            let text = format::format_value(self.heap, &value, "");
            value.drop_with_heap(self.heap);
            frame.push(self.heap.alloc_str(text?)?);
            return Ok(());
        };
        let text = match spec.as_str(self.heap) {
            Some(spec_text) => format::format_value(self.heap, &value, spec_text),
            None => Err(SimpleException::new_msg(ExcType::SystemError, "format spec is not a string").into()),
        };
        value.drop_with_heap(self.heap);
        spec.drop_with_heap(self.heap);
        frame.push(self.heap.alloc_str(text?)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, Const, Exception, Object, Opcode, Runner};

    fn run(build: impl FnOnce(&mut CodeBuilder)) -> Result<Object, Exception> {
        let mut b = CodeBuilder::module("<test>");
        build(&mut b);
        Runner::new(b.build()).run_no_limits()
    }

    #[test]
    fn unpack_ex_collects_the_rest() {
        // [a, b, *rest] = [1, 2, 3, 4, 5]
        let result = run(|b| {
            for i in 1..=5 {
                b.load_const(i);
            }
            b.emit_arg(Opcode::BuildList, 5);
            b.emit_arg(Opcode::UnpackEx, 2);
            for name in ["a", "b", "rest"] {
                b.store_name(name);
            }
            for name in ["a", "b", "rest"] {
                b.load_name(name);
            }
            b.emit_arg(Opcode::BuildTuple, 3);
            b.emit(Opcode::ReturnValue);
        })
        .unwrap();
        assert_eq!(result.to_string(), "(1, 2, [3, 4, 5])");
    }

    #[test]
    fn unpack_ex_leaves_first_item_on_top() {
        // a, *mid, z = [1, 2, 3, 4, 5]; TOS is `a`
        let result = run(|b| {
            for i in 1..=5 {
                b.load_const(i);
            }
            b.emit_arg(Opcode::BuildList, 5);
            b.emit_arg(Opcode::UnpackEx, 1 | (1 << 8));
            b.emit_arg(Opcode::BuildTuple, 3);
            b.emit(Opcode::ReturnValue);
        })
        .unwrap();
        assert_eq!(result.to_string(), "(5, [2, 3, 4], 1)");
    }

    #[test]
    fn unpack_sequence_reports_counts() {
        let err = run(|b| {
            b.load_const(1);
            b.emit_arg(Opcode::BuildList, 1);
            b.emit_arg(Opcode::UnpackSequence, 2);
            b.emit(Opcode::ReturnValue);
        })
        .unwrap_err();
        assert_eq!(err.summary(), "ValueError: not enough values to unpack (expected 2, got 1)");

        let err = run(|b| {
            for i in 0..3 {
                b.load_const(i);
            }
            b.emit_arg(Opcode::BuildTuple, 3);
            b.emit_arg(Opcode::UnpackSequence, 2);
            b.emit(Opcode::ReturnValue);
        })
        .unwrap_err();
        assert_eq!(err.summary(), "ValueError: too many values to unpack (expected 2)");
    }

    #[test]
    fn const_key_map_pairs_keys_with_values() {
        let result = run(|b| {
            b.load_const(1);
            b.load_const(2);
            b.load_const(Const::Tuple(vec![Const::from("a"), Const::from("b")]));
            b.emit_arg(Opcode::BuildConstKeyMap, 2);
            b.emit(Opcode::ReturnValue);
        })
        .unwrap();
        assert_eq!(result.to_string(), "{'a': 1, 'b': 2}");
    }

    #[test]
    fn format_value_with_conversion_and_spec() {
        let result = run(|b| {
            b.load_const("x");
            b.load_const(">5");
            b.emit_arg(Opcode::FormatValue, 0x02 | 0x04);
            b.load_const(7);
            b.emit_arg(Opcode::FormatValue, 0);
            b.emit_arg(Opcode::BuildString, 2);
            b.emit(Opcode::ReturnValue);
        })
        .unwrap();
        assert_eq!(result, Object::Str("  'x'7".to_owned()));
    }
}
