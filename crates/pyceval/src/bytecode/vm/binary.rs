//! Operator opcodes: arithmetic, subscripting and `COMPARE_OP`.

pub(super) use crate::ops::{BinaryOp, UnaryOp};
use crate::{
    bytecode::{CompareOp, Opcode},
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    ops,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::HashKey,
    value::Value,
};

use super::{Frame, VM};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn binary_op(&mut self, frame: &mut Frame, op: BinaryOp, inplace: bool) -> RunResult<()> {
        let right = frame.pop();
        let left = frame.pop();
        let result = self.binary_values(frame, op, inplace, left, right)?;
        frame.push(result);
        Ok(())
    }

    /// Applies a binary operator, consuming both operands.
    fn binary_values(
        &mut self,
        frame: &mut Frame,
        op: BinaryOp,
        inplace: bool,
        left: Value,
        right: Value,
    ) -> RunResult<Value> {
        let kinds = (self.kind_of(&left), self.kind_of(&right));
        match (op, kinds) {
            (BinaryOp::Add, (Kind::Str, Kind::Str)) => return self.concat_str(frame, left, right),
            (BinaryOp::Add, (Kind::List, _)) if inplace => return self.list_extend_inplace(left, right),
            (BinaryOp::Mul, (Kind::List, _)) if inplace && right.as_index().is_some() => {
                return Ok(self.list_repeat_inplace(left, &right));
            }
            (BinaryOp::Or | BinaryOp::And | BinaryOp::Sub | BinaryOp::Xor, (Kind::Set, Kind::Set)) if inplace => {
                return self.set_update_inplace(op, left, right);
            }
            _ => {}
        }
        let result = ops::binary_op(self.heap, op, &left, &right, inplace);
        left.drop_with_heap(self.heap);
        right.drop_with_heap(self.heap);
        result
    }

    fn kind_of(&self, value: &Value) -> Kind {
        match value.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Str(_)) => Kind::Str,
            Some(HeapData::List(_)) => Kind::List,
            Some(HeapData::Set(_)) => Kind::Set,
            _ => Kind::Other,
        }
    }

    /// `str + str`, appending in place when nothing else can observe the left operand.
    ///
    /// When the only other reference to the left string is the variable the result
    /// is about to be stored into, that variable is cleared first so the string
    /// becomes exclusively owned by the stack.
    fn concat_str(&mut self, frame: &mut Frame, left: Value, right: Value) -> RunResult<Value> {
        let Some(id) = left.ref_id() else {
            return Err(crate::exception_private::RunError::internal("str operand without a heap id"));
        };
        if self.heap.get_refcount(id) == 2 {
            self.release_store_target(frame, id);
        }
        if self.heap.get_refcount(id) == 1 {
            let suffix = right.as_str(self.heap).unwrap_or_default().to_owned();
            if let HeapData::Str(s) = self.heap.get_mut(id) {
                s.push_str(&suffix);
            }
            right.drop_with_heap(self.heap);
            return Ok(left);
        }
        let result = ops::binary_op(self.heap, BinaryOp::Add, &left, &right, false);
        left.drop_with_heap(self.heap);
        right.drop_with_heap(self.heap);
        result
    }

    /// Clears the destination of the following store if it still holds `id`.
    fn release_store_target(&mut self, frame: &mut Frame, id: HeapId) {
        let (Some(next), Some(&arg)) = (frame.code.opcode_at(frame.ip), frame.code.bytecode.get(frame.ip + 1)) else {
            return;
        };
        let arg = usize::from(arg);
        match next {
            Opcode::StoreFast => {
                if let Some(slot) = frame.locals.get_mut(arg)
                    && slot.ref_id() == Some(id)
                {
                    std::mem::replace(slot, Value::Undefined).drop_with_heap(self.heap);
                }
            }
            Opcode::StoreDeref => {
                if let Some(&cell) = frame.cells.get(arg)
                    && matches!(self.heap.get(cell), HeapData::Cell(Value::Ref(held)) if *held == id)
                {
                    self.heap.cell_set(cell, Value::Undefined);
                }
            }
            Opcode::StoreName => {
                let (Some(locals), Some(name)) = (frame.locals_dict, frame.code.names.get(arg)) else {
                    return;
                };
                let key = HashKey::str(name);
                let removed = match self.heap.get_mut(locals) {
                    HeapData::Dict(d) if d.get(&key).and_then(Value::ref_id) == Some(id) => d.remove(&key),
                    _ => None,
                };
                removed.drop_with_heap(self.heap);
            }
            _ => {}
        }
    }

    /// `list += iterable` extends the list itself.
    fn list_extend_inplace(&mut self, left: Value, right: Value) -> RunResult<Value> {
        let items = match self.collect_iterable(right) {
            Ok(items) => items,
            Err(e) => {
                left.drop_with_heap(self.heap);
                return Err(e);
            }
        };
        if let Some(id) = left.ref_id()
            && let HeapData::List(list) = self.heap.get_mut(id)
        {
            list.extend(items);
        } else {
            items.drop_with_heap(self.heap);
        }
        Ok(left)
    }

    /// `list *= n` repeats the contents in place.
    fn list_repeat_inplace(&mut self, left: Value, right: &Value) -> Value {
        let count = usize::try_from(right.as_index().unwrap_or(0)).unwrap_or(0);
        let Some(id) = left.ref_id() else { return left };
        let mut copied = Vec::new();
        let removed = match self.heap.get_mut(id) {
            HeapData::List(list) if count == 0 => std::mem::take(list),
            HeapData::List(list) => {
                let len = list.len();
                for _ in 1..count {
                    for i in 0..len {
                        let item = list[i].copy_for_extend();
                        copied.extend(item.ref_id());
                        list.push(item);
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        };
        for item in copied {
            self.heap.inc_ref(item);
        }
        removed.drop_with_heap(self.heap);
        left
    }

    /// `set |= other` and friends mutate the left set.
    fn set_update_inplace(&mut self, op: BinaryOp, left: Value, right: Value) -> RunResult<Value> {
        let (Some(target), Some(source)) = (left.ref_id(), right.ref_id()) else {
            right.drop_with_heap(self.heap);
            return Ok(left);
        };
        let other: Vec<(HashKey, Value)> = match self.heap.get(source) {
            HeapData::Set(s) => s.entries().map(|(k, v)| (k.clone(), v.copy_for_extend())).collect(),
            _ => Vec::new(),
        };
        let mut added = Vec::new();
        let mut removed = Vec::new();
        if let HeapData::Set(set) = self.heap.get_mut(target) {
            match op {
                BinaryOp::Or => {
                    for (hash, value) in &other {
                        if !set.contains(hash) {
                            added.extend(value.ref_id());
                            let _ = set.insert(hash.clone(), value.copy_for_extend());
                        }
                    }
                }
                BinaryOp::And => {
                    let dropped: Vec<HashKey> = set
                        .entries()
                        .filter(|(k, _)| !other.iter().any(|(o, _)| o == *k))
                        .map(|(k, _)| k.clone())
                        .collect();
                    removed.extend(dropped.iter().filter_map(|k| set.remove(k)));
                }
                BinaryOp::Sub => removed.extend(other.iter().filter_map(|(hash, _)| set.remove(hash))),
                _ => {
                    for (hash, value) in &other {
                        match set.remove(hash) {
                            Some(existing) => removed.push(existing),
                            None => {
                                added.extend(value.ref_id());
                                let _ = set.insert(hash.clone(), value.copy_for_extend());
                            }
                        }
                    }
                }
            }
        }
        for id in added {
            self.heap.inc_ref(id);
        }
        other.into_iter().for_each(|(_, v)| v.forget());
        removed.drop_with_heap(self.heap);
        right.drop_with_heap(self.heap);
        Ok(left)
    }

    pub(super) fn unary_op(&mut self, frame: &mut Frame, op: UnaryOp) -> RunResult<()> {
        let operand = frame.pop();
        let result = ops::unary_op(self.heap, op, &operand);
        operand.drop_with_heap(self.heap);
        frame.push(result?);
        Ok(())
    }

    pub(super) fn binary_subscr(&mut self, frame: &mut Frame) -> RunResult<()> {
        let key = frame.pop();
        let container = frame.pop();
        let result = ops::getitem(self.heap, &container, &key);
        key.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        frame.push(result?);
        Ok(())
    }

    /// `STORE_SUBSCR`: TOS1[TOS] = TOS2.
    pub(super) fn store_subscr(&mut self, frame: &mut Frame) -> RunResult<()> {
        let key = frame.pop();
        let container = frame.pop();
        let value = frame.pop();
        let result = ops::setitem(self.heap, &container, key, value);
        container.drop_with_heap(self.heap);
        result
    }

    pub(super) fn delete_subscr(&mut self, frame: &mut Frame) -> RunResult<()> {
        let key = frame.pop();
        let container = frame.pop();
        let result = ops::delitem(self.heap, &container, &key);
        key.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        result
    }

    pub(super) fn compare_op(&mut self, frame: &mut Frame, arg: u32) -> RunResult<()> {
        let op = u8::try_from(arg)
            .ok()
            .and_then(CompareOp::from_repr)
            .ok_or_else(|| ExcType::system_error("unknown comparison operator"))?;
        let right = frame.pop();
        let left = frame.pop();
        let result = match op {
            CompareOp::Is => Ok(left.is_identical(&right)),
            CompareOp::IsNot => Ok(!left.is_identical(&right)),
            CompareOp::In => self.contains(&right, &left),
            CompareOp::NotIn => self.contains(&right, &left).map(|found| !found),
            CompareOp::ExceptionMatch => self.exception_matches(&left, &right),
            _ => ops::rich_compare(self.heap, op, &left, &right),
        };
        left.drop_with_heap(self.heap);
        right.drop_with_heap(self.heap);
        frame.push(Value::Bool(result?));
        Ok(())
    }

    /// `item in container`, iterating when the container cannot answer directly.
    pub(super) fn contains(&mut self, container: &Value, item: &Value) -> RunResult<bool> {
        if let Some(found) = ops::contains(self.heap, container, item)? {
            return Ok(found);
        }
        let iter = self.get_iter(container)?;
        let result = loop {
            match self.iter_next_value(&iter) {
                Ok(Some(value)) => {
                    let equal = value.py_eq(item, self.heap);
                    value.drop_with_heap(self.heap);
                    if equal {
                        break Ok(true);
                    }
                }
                Ok(None) => break Ok(false),
                Err(e) => break Err(e),
            }
        };
        iter.drop_with_heap(self.heap);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Str,
    List,
    Set,
    Other,
}
