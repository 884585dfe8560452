//! `isinstance()` and `abs()`.

use super::{Builtins, one_arg, unpack_args};
use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    resource::ResourceTracker,
    types::ContextManager,
    value::Value,
};

pub(super) fn builtin_abs(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let value = one_arg(heap, "abs", args)?;
    let result = match &value {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| ExcType::overflow("integer overflow in abs()")),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        _ => Err(ExcType::type_error(format!(
            "bad operand type for abs(): '{}'",
            value.type_name(heap)
        ))),
    };
    value.drop_with_heap(heap);
    result
}

/// `isinstance(obj, class_or_tuple)`.
pub(super) fn builtin_isinstance(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let args = unpack_args(heap, "isinstance", args, 2, 2)?;
    let result = match args.as_slice() {
        [obj, class] => matches_class(heap, obj, class),
        _ => unreachable!("unpack_args checked the arity"),
    };
    args.drop_with_heap(heap);
    result.map(Value::Bool)
}

fn matches_class(heap: &Heap<impl ResourceTracker>, obj: &Value, class: &Value) -> RunResult<bool> {
    match class {
        Value::Builtin(builtin) if builtin.is_type() => Ok(is_instance_of_builtin(heap, obj, *builtin)),
        Value::ExcClass(exc_type) => Ok(obj.ref_id().is_some_and(|id| {
            matches!(heap.get(id), HeapData::Exception(exc) if exc.exc_type.is_subclass_of(*exc_type))
        })),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Tuple(classes) => {
                for class in classes {
                    if matches_class(heap, obj, class)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(not_a_type()),
        },
        _ => Err(not_a_type()),
    }
}

fn not_a_type() -> crate::exception_private::RunError {
    ExcType::type_error("isinstance() arg 2 must be a type or tuple of types")
}

fn is_instance_of_builtin(heap: &Heap<impl ResourceTracker>, obj: &Value, builtin: Builtins) -> bool {
    match obj {
        Value::Bool(_) => matches!(builtin, Builtins::Bool | Builtins::Int),
        Value::Int(_) => builtin == Builtins::Int,
        Value::Float(_) => builtin == Builtins::Float,
        Value::Ref(id) => matches!(
            (heap.get(*id), builtin),
            (HeapData::Str(_), Builtins::Str)
                | (HeapData::List(_), Builtins::List)
                | (HeapData::Tuple(_), Builtins::Tuple)
                | (HeapData::Dict(_), Builtins::Dict)
                | (HeapData::Set(_), Builtins::Set)
                | (HeapData::Range(_), Builtins::Range)
                | (HeapData::ContextManager(ContextManager::Suppress(_)), Builtins::Suppress)
                | (HeapData::ContextManager(ContextManager::NullContext(_)), Builtins::NullContext)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{builtin_abs, builtin_isinstance};
    use crate::{
        builtins::Builtins,
        exception_private::ExcType,
        heap::{DropWithHeap, Heap},
        resource::NoLimitTracker,
        value::Value,
    };

    #[test]
    fn bool_is_an_int() {
        let mut heap = Heap::new(16, NoLimitTracker);
        let result = builtin_isinstance(&mut heap, vec![Value::Bool(true), Value::Builtin(Builtins::Int)]).unwrap();
        assert!(matches!(result, Value::Bool(true)));
        let result = builtin_isinstance(&mut heap, vec![Value::Int(1), Value::Builtin(Builtins::Bool)]).unwrap();
        assert!(matches!(result, Value::Bool(false)));
    }

    #[test]
    fn tuple_of_classes_and_bad_class() {
        let mut heap = Heap::new(16, NoLimitTracker);
        let classes = heap
            .alloc_tuple(vec![Value::Builtin(Builtins::Str), Value::ExcClass(ExcType::ValueError)])
            .unwrap();
        let s = heap.alloc_str("x").unwrap();
        let result = builtin_isinstance(&mut heap, vec![s, classes]).unwrap();
        assert!(matches!(result, Value::Bool(true)));

        let err = builtin_isinstance(&mut heap, vec![Value::Int(1), Value::Int(2)]).unwrap_err();
        assert!(format!("{err:?}").contains("isinstance() arg 2 must be a type or tuple of types"));
    }

    #[test]
    fn abs_of_min_int_overflows() {
        let mut heap = Heap::new(16, NoLimitTracker);
        assert!(matches!(builtin_abs(&mut heap, vec![Value::Int(-3)]).unwrap(), Value::Int(3)));
        assert!(builtin_abs(&mut heap, vec![Value::Int(i64::MIN)]).is_err());
        let s = heap.alloc_str("x").unwrap();
        let err = builtin_abs(&mut heap, vec![s]).unwrap_err();
        assert!(format!("{err:?}").contains("bad operand type for abs(): 'str'"));
        err.drop_with_heap(&mut heap);
    }
}
