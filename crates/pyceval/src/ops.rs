//! Object-model operations on built-in types: arithmetic, comparison,
//! containment, subscripting and `len()`.
//!
//! Everything here works on the heap alone. Operations that need to run Python
//! code (iterating a generator, calling a function) live on the VM.

use std::cmp::Ordering;

use crate::{
    bytecode::CompareOp,
    exception_private::{ExcType, ExceptionRaise, RunError, RunResult},
    format::percent_format,
    heap::{DropWithHeap, Heap, HeapData},
    resource::ResourceTracker,
    types::{ExceptionObject, Range, Set, Slice, SliceIndices, dict_set_item},
    value::{Number, Value},
};

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    MatMul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::MatMul => "@",
            Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "** or pow()",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
        }
    }

    pub fn inplace_symbol(self) -> &'static str {
        match self {
            Self::Add => "+=",
            Self::Sub => "-=",
            Self::Mul => "*=",
            Self::MatMul => "@=",
            Self::TrueDiv => "/=",
            Self::FloorDiv => "//=",
            Self::Mod => "%=",
            Self::Pow => "**=",
            Self::LShift => "<<=",
            Self::RShift => ">>=",
            Self::And => "&=",
            Self::Or => "|=",
            Self::Xor => "^=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Pos,
    Neg,
    Invert,
}

fn int_overflow() -> RunError {
    ExcType::overflow("integer overflow")
}

// ============================================================================
// Binary operators
// ============================================================================

/// Applies `op` to two operands, returning a new reference.
///
/// `inplace` only changes the operator spelled in error messages; in-place
/// mutation of lists and sets is handled by the caller.
pub(crate) fn binary_op(
    heap: &mut Heap<impl ResourceTracker>,
    op: BinaryOp,
    left: &Value,
    right: &Value,
    inplace: bool,
) -> RunResult<Value> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        if let (Value::Bool(x), Value::Bool(y)) = (left, right) {
            match op {
                BinaryOp::And => return Ok(Value::Bool(*x & *y)),
                BinaryOp::Or => return Ok(Value::Bool(*x | *y)),
                BinaryOp::Xor => return Ok(Value::Bool(*x ^ *y)),
                _ => {}
            }
        }
        if let Some(result) = numeric_op(op, a, b)? {
            return Ok(result);
        }
    } else if let Some(result) = container_op(heap, op, left, right)? {
        return Ok(result);
    }
    let symbol = if inplace { op.inplace_symbol() } else { op.symbol() };
    Err(ExcType::type_error_unsupported_binary(
        symbol,
        left.type_name(heap),
        right.type_name(heap),
    ))
}

/// Numeric arithmetic; `Ok(None)` when the operator does not apply (e.g. `1.0 & 2`).
fn numeric_op(op: BinaryOp, a: Number, b: Number) -> RunResult<Option<Value>> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => int_op(op, x, y),
        _ => float_op(op, a.as_f64(), b.as_f64()),
    }
}

#[expect(clippy::cast_precision_loss, reason = "int true division converts to float")]
fn int_op(op: BinaryOp, x: i64, y: i64) -> RunResult<Option<Value>> {
    let value = match op {
        BinaryOp::Add => Value::Int(x.checked_add(y).ok_or_else(int_overflow)?),
        BinaryOp::Sub => Value::Int(x.checked_sub(y).ok_or_else(int_overflow)?),
        BinaryOp::Mul => Value::Int(x.checked_mul(y).ok_or_else(int_overflow)?),
        BinaryOp::TrueDiv => {
            if y == 0 {
                return Err(ExcType::zero_division("division by zero"));
            }
            Value::Float(x as f64 / y as f64)
        }
        BinaryOp::FloorDiv => {
            if y == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let q = x.checked_div(y).ok_or_else(int_overflow)?;
            Value::Int(if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q })
        }
        BinaryOp::Mod => {
            if y == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let r = x.checked_rem(y).unwrap_or(0);
            Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r })
        }
        BinaryOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
                }
                #[expect(clippy::cast_possible_truncation, reason = "exponent clamped to i32 range")]
                let exp = y.max(i64::from(i32::MIN)) as i32;
                Value::Float((x as f64).powi(exp))
            } else {
                let exp = u32::try_from(y).map_err(|_| int_overflow())?;
                Value::Int(x.checked_pow(exp).ok_or_else(int_overflow)?)
            }
        }
        BinaryOp::LShift => {
            if y < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            if x == 0 {
                Value::Int(0)
            } else {
                let shift = u32::try_from(y).ok().filter(|s| *s < 64).ok_or_else(int_overflow)?;
                let shifted = x << shift;
                if shifted >> shift != x {
                    return Err(int_overflow());
                }
                Value::Int(shifted)
            }
        }
        BinaryOp::RShift => {
            if y < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            Value::Int(x >> y.min(63))
        }
        BinaryOp::And => Value::Int(x & y),
        BinaryOp::Or => Value::Int(x | y),
        BinaryOp::Xor => Value::Int(x ^ y),
        BinaryOp::MatMul => return Ok(None),
    };
    Ok(Some(value))
}

fn float_op(op: BinaryOp, x: f64, y: f64) -> RunResult<Option<Value>> {
    let value = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::TrueDiv => {
            if y == 0.0 {
                return Err(ExcType::zero_division("float division by zero"));
            }
            x / y
        }
        BinaryOp::FloorDiv => {
            if y == 0.0 {
                return Err(ExcType::zero_division("float divmod()"));
            }
            (x / y).floor()
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                return Err(ExcType::zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }
        }
        BinaryOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(ExcType::value_error("math domain error"));
            }
            x.powf(y)
        }
        _ => return Ok(None),
    };
    Ok(Some(Value::Float(value)))
}

/// Concatenation, repetition, set algebra and `%` formatting.
fn container_op(
    heap: &mut Heap<impl ResourceTracker>,
    op: BinaryOp,
    left: &Value,
    right: &Value,
) -> RunResult<Option<Value>> {
    match (op, left, right) {
        (BinaryOp::Mul, Value::Ref(_), count) | (BinaryOp::Mul, count, Value::Ref(_))
            if count.as_index().is_some() =>
        {
            let seq = if matches!(left, Value::Ref(_)) { left } else { right };
            repeat(heap, seq, count.as_index().unwrap_or(0))
        }
        (BinaryOp::Mod, Value::Ref(id), _) if matches!(heap.get(*id), HeapData::Str(_)) => {
            let HeapData::Str(template) = heap.get(*id) else {
                return Ok(None);
            };
            let template = template.clone();
            let formatted = percent_format(heap, &template, right)?;
            Ok(Some(heap.alloc_str(formatted)?))
        }
        (_, Value::Ref(a), Value::Ref(b)) => {
            let result = match (op, heap.get(*a), heap.get(*b)) {
                (BinaryOp::Add, HeapData::Str(x), HeapData::Str(y)) => {
                    let mut s = String::with_capacity(x.len() + y.len());
                    s.push_str(x);
                    s.push_str(y);
                    HeapData::Str(s)
                }
                (BinaryOp::Add, HeapData::List(x), HeapData::List(y)) => {
                    HeapData::List(x.iter().chain(y).map(Value::copy_for_extend).collect())
                }
                (BinaryOp::Add, HeapData::Tuple(x), HeapData::Tuple(y)) => {
                    HeapData::Tuple(x.iter().chain(y).map(Value::copy_for_extend).collect())
                }
                (BinaryOp::Or | BinaryOp::And | BinaryOp::Sub | BinaryOp::Xor, HeapData::Set(x), HeapData::Set(y)) => {
                    let mut out = Set::new();
                    let keep_left = |k| match op {
                        BinaryOp::Or => true,
                        BinaryOp::And => y.contains(k),
                        _ => !y.contains(k),
                    };
                    for (hash, v) in x.entries().filter(|(k, _)| keep_left(*k)) {
                        let _ = out.insert(hash.clone(), v.copy_for_extend());
                    }
                    if matches!(op, BinaryOp::Or | BinaryOp::Xor) {
                        for (hash, v) in y.entries().filter(|(k, _)| !x.contains(k)) {
                            let _ = out.insert(hash.clone(), v.copy_for_extend());
                        }
                    }
                    HeapData::Set(out)
                }
                _ => return Ok(None),
            };
            inc_ref_children(heap, &result);
            Ok(Some(Value::Ref(heap.allocate(result)?)))
        }
        _ => Ok(None),
    }
}

/// Takes the references owned by a freshly assembled container built with `copy_for_extend`.
fn inc_ref_children(heap: &mut Heap<impl ResourceTracker>, data: &HeapData) {
    match data {
        HeapData::List(items) | HeapData::Tuple(items) => heap.inc_ref_values(items),
        HeapData::Set(set) => {
            let values = set.values_copy();
            heap.inc_ref_values(&values);
            values.into_iter().for_each(Value::forget);
        }
        _ => {}
    }
}

/// `seq * count` for str, list and tuple.
fn repeat(heap: &mut Heap<impl ResourceTracker>, seq: &Value, count: i64) -> RunResult<Option<Value>> {
    let Value::Ref(id) = seq else { return Ok(None) };
    let count = usize::try_from(count).unwrap_or(0);
    let too_long = || ExcType::overflow("repeated sequence is too long");
    let data = match heap.get(*id) {
        HeapData::Str(s) => {
            s.len().checked_mul(count).ok_or_else(too_long)?;
            HeapData::Str(s.repeat(count))
        }
        HeapData::List(items) | HeapData::Tuple(items) => {
            let total = items.len().checked_mul(count).ok_or_else(too_long)?;
            let mut out = Vec::with_capacity(total);
            for _ in 0..count {
                out.extend(items.iter().map(Value::copy_for_extend));
            }
            if matches!(heap.get(*id), HeapData::List(_)) {
                HeapData::List(out)
            } else {
                HeapData::Tuple(out)
            }
        }
        _ => return Ok(None),
    };
    inc_ref_children(heap, &data);
    Ok(Some(Value::Ref(heap.allocate(data)?)))
}

// ============================================================================
// Unary operators
// ============================================================================

pub(crate) fn unary_op(heap: &Heap<impl ResourceTracker>, op: UnaryOp, operand: &Value) -> RunResult<Value> {
    let result = match (op, operand.as_number()) {
        (UnaryOp::Pos, Some(Number::Int(i))) => Some(Value::Int(i)),
        (UnaryOp::Pos, Some(Number::Float(f))) => Some(Value::Float(f)),
        (UnaryOp::Neg, Some(Number::Int(i))) => Some(Value::Int(i.checked_neg().ok_or_else(int_overflow)?)),
        (UnaryOp::Neg, Some(Number::Float(f))) => Some(Value::Float(-f)),
        (UnaryOp::Invert, Some(Number::Int(i))) => Some(Value::Int(!i)),
        _ => None,
    };
    result.ok_or_else(|| {
        let symbol = match op {
            UnaryOp::Pos => "+",
            UnaryOp::Neg => "-",
            UnaryOp::Invert => "~",
        };
        ExcType::type_error_bad_operand_unary(symbol, operand.type_name(heap))
    })
}

// ============================================================================
// Comparison and containment
// ============================================================================

/// Rich comparison for `< <= == != > >=`.
pub(crate) fn rich_compare(
    heap: &Heap<impl ResourceTracker>,
    op: CompareOp,
    left: &Value,
    right: &Value,
) -> RunResult<bool> {
    match op {
        CompareOp::Eq => return Ok(left.py_eq(right, heap)),
        CompareOp::Ne => return Ok(!left.py_eq(right, heap)),
        _ => {}
    }
    let accept = |ord: Ordering| match op {
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        _ => ord != Ordering::Less,
    };
    if left.as_number().is_some() && right.as_number().is_some() {
        return Ok(left.py_partial_cmp(right, heap).is_some_and(accept));
    }
    if let (Value::Ref(a), Value::Ref(b)) = (left, right) {
        match (heap.get(*a), heap.get(*b)) {
            (HeapData::Str(x), HeapData::Str(y)) => return Ok(accept(x.as_str().cmp(y.as_str()))),
            (HeapData::List(x), HeapData::List(y)) | (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                return match x.iter().zip(y).find(|(l, r)| !l.py_eq(r, heap)) {
                    Some((l, r)) => rich_compare(heap, op, l, r),
                    None => Ok(accept(x.len().cmp(&y.len()))),
                };
            }
            (HeapData::Set(x), HeapData::Set(y)) => {
                return Ok(match x.subset_cmp(y) {
                    Some(Ordering::Equal) => matches!(op, CompareOp::Le | CompareOp::Ge),
                    Some(ord) => accept(ord),
                    None => false,
                });
            }
            _ => {}
        }
    }
    Err(ExcType::type_error_unorderable(
        op.symbol(),
        left.type_name(heap),
        right.type_name(heap),
    ))
}

/// `item in container` for containers that can answer without running code.
///
/// `Ok(None)` means the container must be iterated (iterators, generators).
pub(crate) fn contains(heap: &Heap<impl ResourceTracker>, container: &Value, item: &Value) -> RunResult<Option<bool>> {
    let Value::Ref(id) = container else {
        return Err(ExcType::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name(heap)
        )));
    };
    Ok(Some(match heap.get(*id) {
        HeapData::Str(haystack) => match item.as_str(heap) {
            Some(needle) => haystack.contains(needle),
            None => {
                return Err(ExcType::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    item.type_name(heap)
                )));
            }
        },
        HeapData::List(items) | HeapData::Tuple(items) => items.iter().any(|v| v.py_eq(item, heap)),
        HeapData::Dict(d) => d.contains(&item.hash_key(heap)?),
        HeapData::Set(s) => s.contains(&item.hash_key(heap)?),
        HeapData::Range(r) => match item {
            Value::Float(f) => {
                #[expect(clippy::cast_possible_truncation, reason = "only integral floats are tested")]
                let as_int = *f as i64;
                f.fract() == 0.0 && r.contains(as_int)
            }
            other => other.as_index().is_some_and(|i| r.contains(i)),
        },
        HeapData::Iter(_)
        | HeapData::Generator(_)
        | HeapData::CoroutineWrapper(_)
        | HeapData::AsyncGenAwaitable(_) => return Ok(None),
        _ => {
            return Err(ExcType::type_error(format!(
                "argument of type '{}' is not iterable",
                container.type_name(heap)
            )));
        }
    }))
}

// ============================================================================
// Subscripting
// ============================================================================

/// Resolves a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len_i = i64::try_from(len).ok()?;
    let idx = if index < 0 { index + len_i } else { index };
    usize::try_from(idx).ok().filter(|i| *i < len)
}

/// `KeyError(key)` carrying the key object itself.
pub(crate) fn key_error(heap: &mut Heap<impl ResourceTracker>, key: &Value) -> RunError {
    let arg = key.clone_with_heap(heap);
    match heap.allocate(HeapData::Exception(ExceptionObject::new(ExcType::KeyError, vec![arg]))) {
        Ok(id) => ExceptionRaise::from_instance(id, Vec::new()).into(),
        Err(e) => e.into(),
    }
}

fn slice_of<'h>(heap: &'h Heap<impl ResourceTracker>, key: &Value) -> Option<&'h Slice> {
    match key {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Slice(s) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

/// `obj[key]`, returning a new reference.
pub(crate) fn getitem(heap: &mut Heap<impl ResourceTracker>, obj: &Value, key: &Value) -> RunResult<Value> {
    let Value::Ref(id) = obj else {
        return Err(ExcType::type_error_not_subscriptable(obj.type_name(heap)));
    };
    let id = *id;
    if let Some(slice) = slice_of(heap, key) {
        return getitem_slice(heap, obj, slice.indices(sequence_len(heap, obj).unwrap_or(0))?);
    }
    let found = match heap.get(id) {
        HeapData::List(items) | HeapData::Tuple(items) => {
            let kind = obj.type_name(heap);
            let index = key.as_index().ok_or_else(|| {
                ExcType::type_error(format!(
                    "{kind} indices must be integers or slices, not {}",
                    key.type_name(heap)
                ))
            })?;
            let index = normalize_index(index, items.len()).ok_or_else(|| {
                ExcType::index_error(if kind == "list" {
                    "list index out of range"
                } else {
                    "tuple index out of range"
                })
            })?;
            items[index].copy_for_extend()
        }
        HeapData::Str(s) => {
            let index = key
                .as_index()
                .ok_or_else(|| ExcType::type_error("string indices must be integers"))?;
            let count = s.chars().count();
            let index = normalize_index(index, count).ok_or_else(|| ExcType::index_error("string index out of range"))?;
            let c = s.chars().nth(index).unwrap_or_default();
            return Ok(heap.alloc_str(c.to_string())?);
        }
        HeapData::Range(r) => {
            let index = key.as_index().ok_or_else(|| {
                ExcType::type_error(format!(
                    "range indices must be integers or slices, not {}",
                    key.type_name(heap)
                ))
            })?;
            let index =
                normalize_index(index, r.len()).ok_or_else(|| ExcType::index_error("range object index out of range"))?;
            Value::Int(r.get(index).unwrap_or_default())
        }
        HeapData::Dict(d) => {
            let hash = key.hash_key(heap)?;
            d.get(&hash).map(Value::copy_for_extend).unwrap_or(Value::Undefined)
        }
        _ => return Err(ExcType::type_error_not_subscriptable(obj.type_name(heap))),
    };
    if found.is_undefined() {
        return Err(key_error(heap, key));
    }
    if let Value::Ref(item) = &found {
        heap.inc_ref(*item);
    }
    Ok(found)
}

fn sequence_len(heap: &Heap<impl ResourceTracker>, obj: &Value) -> Option<usize> {
    match heap.get(obj.ref_id()?) {
        HeapData::List(items) | HeapData::Tuple(items) => Some(items.len()),
        HeapData::Str(s) => Some(s.chars().count()),
        HeapData::Range(r) => Some(r.len()),
        _ => None,
    }
}

fn getitem_slice(heap: &mut Heap<impl ResourceTracker>, obj: &Value, idx: SliceIndices) -> RunResult<Value> {
    let Some(id) = obj.ref_id() else {
        return Err(ExcType::type_error_not_subscriptable(obj.type_name(heap)));
    };
    let data = match heap.get(id) {
        HeapData::List(items) => HeapData::List(idx.positions().map(|i| items[i].copy_for_extend()).collect()),
        HeapData::Tuple(items) => HeapData::Tuple(idx.positions().map(|i| items[i].copy_for_extend()).collect()),
        HeapData::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            HeapData::Str(idx.positions().map(|i| chars[i]).collect())
        }
        HeapData::Range(r) => {
            let start = r.start + idx.start * r.step;
            let step = r.step * idx.step;
            let len = i64::try_from(idx.len).unwrap_or(i64::MAX);
            HeapData::Range(Range::new(start, start + len * step, step)?)
        }
        HeapData::Dict(_) => return Err(ExcType::type_error_unhashable("slice")),
        _ => return Err(ExcType::type_error_not_subscriptable(obj.type_name(heap))),
    };
    inc_ref_children(heap, &data);
    Ok(Value::Ref(heap.allocate(data)?))
}

/// `obj[key] = value`, consuming `key` and `value`.
pub(crate) fn setitem(heap: &mut Heap<impl ResourceTracker>, obj: &Value, key: Value, value: Value) -> RunResult<()> {
    match obj.ref_id().map(|id| (id, heap.get(id))) {
        Some((id, HeapData::Dict(_))) => dict_set_item(heap, id, key, value),
        Some((_, HeapData::List(items))) => {
            let len = items.len();
            let result = if let Some(slice) = slice_of(heap, &key) {
                match slice.indices(len) {
                    Ok(indices) => assign_slice(heap, obj, indices, value),
                    Err(e) => {
                        value.drop_with_heap(heap);
                        Err(e)
                    }
                }
            } else {
                match key.as_index() {
                    Some(index) => match normalize_index(index, len) {
                        Some(index) => {
                            let old = match obj.ref_id().map(|id| heap.get_mut(id)) {
                                Some(HeapData::List(items)) => std::mem::replace(&mut items[index], value),
                                _ => value,
                            };
                            old.drop_with_heap(heap);
                            Ok(())
                        }
                        None => {
                            value.drop_with_heap(heap);
                            Err(ExcType::index_error("list assignment index out of range"))
                        }
                    },
                    None => {
                        let msg = format!("list indices must be integers or slices, not {}", key.type_name(heap));
                        value.drop_with_heap(heap);
                        Err(ExcType::type_error(msg))
                    }
                }
            };
            key.drop_with_heap(heap);
            result
        }
        _ => {
            let msg = format!("'{}' object does not support item assignment", obj.type_name(heap));
            key.drop_with_heap(heap);
            value.drop_with_heap(heap);
            Err(ExcType::type_error(msg))
        }
    }
}

/// `list[a:b:c] = value` where `value` is a list or tuple.
fn assign_slice(heap: &mut Heap<impl ResourceTracker>, obj: &Value, idx: SliceIndices, value: Value) -> RunResult<()> {
    let replacement = match value.ref_id().and_then(|id| heap.sequence_items(id)) {
        Some(items) => items,
        None => {
            let msg = if idx.step == 1 {
                "can only assign an iterable".to_owned()
            } else {
                "must assign iterable to extended slice".to_owned()
            };
            value.drop_with_heap(heap);
            return Err(ExcType::type_error(msg));
        }
    };
    value.drop_with_heap(heap);
    let Some(list_id) = obj.ref_id() else { return Ok(()) };
    let removed: Vec<Value> = if idx.step == 1 {
        let start = usize::try_from(idx.start).unwrap_or(0);
        let end = start + idx.len;
        match heap.get_mut(list_id) {
            HeapData::List(items) => items.splice(start..end, replacement).collect(),
            _ => replacement,
        }
    } else {
        if replacement.len() != idx.len {
            let msg = format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                replacement.len(),
                idx.len
            );
            replacement.drop_with_heap(heap);
            return Err(ExcType::value_error(msg));
        }
        match heap.get_mut(list_id) {
            HeapData::List(items) => idx
                .positions()
                .zip(replacement)
                .map(|(i, v)| std::mem::replace(&mut items[i], v))
                .collect(),
            _ => replacement,
        }
    };
    removed.drop_with_heap(heap);
    Ok(())
}

/// `del obj[key]`.
pub(crate) fn delitem(heap: &mut Heap<impl ResourceTracker>, obj: &Value, key: &Value) -> RunResult<()> {
    let Some(id) = obj.ref_id() else {
        return Err(ExcType::type_error(format!(
            "'{}' object doesn't support item deletion",
            obj.type_name(heap)
        )));
    };
    let removed: Vec<Value> = match heap.get(id) {
        HeapData::Dict(_) => {
            let hash = key.hash_key(heap)?;
            let removed = match heap.get_mut(id) {
                HeapData::Dict(d) => d.remove(&hash),
                _ => None,
            };
            match removed {
                Some((k, v)) => vec![k, v],
                None => return Err(key_error(heap, key)),
            }
        }
        HeapData::List(items) => {
            let len = items.len();
            if let Some(slice) = slice_of(heap, key) {
                let idx = slice.indices(len)?;
                let mut positions: Vec<usize> = idx.positions().collect();
                positions.sort_unstable();
                match heap.get_mut(id) {
                    HeapData::List(items) => positions.iter().rev().map(|&i| items.remove(i)).collect(),
                    _ => Vec::new(),
                }
            } else {
                let index = key.as_index().ok_or_else(|| {
                    ExcType::type_error(format!(
                        "list indices must be integers or slices, not {}",
                        key.type_name(heap)
                    ))
                })?;
                let index = normalize_index(index, len)
                    .ok_or_else(|| ExcType::index_error("list assignment index out of range"))?;
                match heap.get_mut(id) {
                    HeapData::List(items) => vec![items.remove(index)],
                    _ => Vec::new(),
                }
            }
        }
        _ => {
            return Err(ExcType::type_error(format!(
                "'{}' object doesn't support item deletion",
                obj.type_name(heap)
            )));
        }
    };
    removed.drop_with_heap(heap);
    Ok(())
}

/// `len(obj)`.
pub(crate) fn len(heap: &Heap<impl ResourceTracker>, obj: &Value) -> RunResult<usize> {
    let found = obj.ref_id().and_then(|id| match heap.get(id) {
        HeapData::Str(s) => Some(s.chars().count()),
        HeapData::List(items) | HeapData::Tuple(items) => Some(items.len()),
        HeapData::Dict(d) => Some(d.len()),
        HeapData::Set(s) => Some(s.len()),
        HeapData::Range(r) => Some(r.len()),
        _ => None,
    });
    found.ok_or_else(|| ExcType::type_error(format!("object of type '{}' has no len()", obj.type_name(heap))))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resource::NoLimitTracker;

    fn message(err: RunError) -> String {
        match err {
            RunError::Exc(raise) => match &raise.value {
                crate::exception_private::RaisedValue::Simple(s) => s.arg().unwrap_or_default().to_owned(),
                crate::exception_private::RaisedValue::Instance(_) => String::from("<instance>"),
            },
            other => format!("{other:?}"),
        }
    }

    #[test]
    fn python_floor_division_and_modulo() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let cases = [(7, 2, 3, 1), (-7, 2, -4, 1), (7, -2, -4, -1), (-7, -2, 3, -1)];
        for (a, b, q, r) in cases {
            let got_q = binary_op(&mut heap, BinaryOp::FloorDiv, &Value::Int(a), &Value::Int(b), false).unwrap();
            let got_r = binary_op(&mut heap, BinaryOp::Mod, &Value::Int(a), &Value::Int(b), false).unwrap();
            assert!(matches!(got_q, Value::Int(x) if x == q), "{a} // {b}");
            assert!(matches!(got_r, Value::Int(x) if x == r), "{a} % {b}");
        }
    }

    #[test]
    fn division_by_zero_messages() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let err = binary_op(&mut heap, BinaryOp::TrueDiv, &Value::Int(1), &Value::Int(0), false).unwrap_err();
        assert_eq!(message(err), "division by zero");
        let err = binary_op(&mut heap, BinaryOp::Mod, &Value::Float(1.0), &Value::Int(0), false).unwrap_err();
        assert_eq!(message(err), "float modulo");
    }

    #[test]
    fn overflow_is_reported() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let err = binary_op(&mut heap, BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1), false).unwrap_err();
        assert_eq!(err.exc_type(&heap), Some(ExcType::OverflowError));
    }

    #[test]
    fn unsupported_operands_name_both_types() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let s = heap.alloc_str("a").unwrap();
        let err = binary_op(&mut heap, BinaryOp::Sub, &s, &Value::Int(1), true).unwrap_err();
        assert_eq!(message(err), "unsupported operand type(s) for -=: 'str' and 'int'");
        s.drop_with_heap(&mut heap);
    }

    #[test]
    fn sequence_concat_and_repeat() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let a = heap.alloc_list(vec![Value::Int(1)]).unwrap();
        let b = heap.alloc_list(vec![Value::Int(2)]).unwrap();
        let sum = binary_op(&mut heap, BinaryOp::Add, &a, &b, false).unwrap();
        assert_eq!(sum.py_repr(&heap), "[1, 2]");
        let rep = binary_op(&mut heap, BinaryOp::Mul, &Value::Int(2), &sum, false).unwrap();
        assert_eq!(rep.py_repr(&heap), "[1, 2, 1, 2]");
        for v in [a, b, sum, rep] {
            v.drop_with_heap(&mut heap);
        }
        assert_eq!(heap.heap_stats().live_objects, 0);
    }

    #[test]
    fn unorderable_comparison() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let s = heap.alloc_str("a").unwrap();
        let err = rich_compare(&heap, CompareOp::Lt, &Value::Int(1), &s).unwrap_err();
        assert_eq!(message(err), "'<' not supported between instances of 'int' and 'str'");
        assert!(!rich_compare(&heap, CompareOp::Lt, &Value::Float(f64::NAN), &Value::Int(1)).unwrap());
        s.drop_with_heap(&mut heap);
    }

    #[test]
    fn negative_index_and_slices() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let list = heap.alloc_list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
        let last = getitem(&mut heap, &list, &Value::Int(-1)).unwrap();
        assert!(matches!(last, Value::Int(3)));
        let err = getitem(&mut heap, &list, &Value::Int(3)).unwrap_err();
        assert_eq!(message(err), "list index out of range");
        let slice = heap
            .allocate(HeapData::Slice(Slice {
                start: Value::None,
                stop: Value::None,
                step: Value::Int(-1),
            }))
            .unwrap();
        let reversed = getitem(&mut heap, &list, &Value::Ref(slice)).unwrap();
        assert_eq!(reversed.py_repr(&heap), "[3, 2, 1]");
        reversed.drop_with_heap(&mut heap);
        heap.dec_ref(slice);
        list.drop_with_heap(&mut heap);
        assert_eq!(heap.heap_stats().live_objects, 0);
    }

    #[test]
    fn missing_dict_key_raises_key_error_with_key() {
        let mut heap = Heap::new(8, NoLimitTracker);
        let dict = heap.allocate(HeapData::Dict(crate::types::Dict::new())).unwrap();
        let key = heap.alloc_str("k").unwrap();
        let err = getitem(&mut heap, &Value::Ref(dict), &key).unwrap_err();
        assert_eq!(err.exc_type(&heap), Some(ExcType::KeyError));
        err.drop_with_heap(&mut heap);
        key.drop_with_heap(&mut heap);
        heap.dec_ref(dict);
        assert_eq!(heap.heap_stats().live_objects, 0);
    }
}
