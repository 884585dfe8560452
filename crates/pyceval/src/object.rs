use std::fmt::{self, Write};

use ahash::AHashSet;

use crate::{
    exception_private::ExcType,
    heap::{Heap, HeapData, HeapId},
    resource::ResourceTracker,
    value::{Value, float_repr, string_repr_into},
};

/// A Python value handed back to the host once evaluation finishes.
///
/// `Object` owns its data and needs no heap. Containers are converted
/// recursively; anything without a structural mapping (functions, generators,
/// modules, ...) becomes [`Object::Repr`] holding its `repr()`.
///
/// `Display` matches Python's `str()`: strings print bare, everything else as
/// its `repr()`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Self>),
    Tuple(Vec<Self>),
    /// Insertion-ordered key/value pairs.
    Dict(Vec<(Self, Self)>),
    Set(Vec<Self>),
    /// An exception instance returned as a value (not raised).
    Exception {
        exc_type: ExcType,
        arg: Option<String>,
    },
    /// Fallback for values with no other variant: the `repr()` text.
    Repr(String),
    /// A container reached again while converting it, e.g. `a = []; a.append(a)`.
    ///
    /// Holds the placeholder Python prints in that position (`[...]`, `{...}`).
    Cycle(String),
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            _ => self.repr_fmt(f),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) | (Self::Repr(a), Self::Repr(b)) | (Self::Cycle(a), Self::Cycle(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) | (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (
                Self::Exception { exc_type: at, arg: aa },
                Self::Exception { exc_type: bt, arg: ba },
            ) => at == bt && aa == ba,
            _ => false,
        }
    }
}

impl Object {
    /// Converts `value` out of the heap and releases it.
    pub(crate) fn new(value: Value, heap: &mut Heap<impl ResourceTracker>) -> Self {
        let object = match &value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => Self::Float(*f),
            _ => Self::from_value(&value, heap, &mut AHashSet::new()),
        };
        value.drop_with_heap(heap);
        object
    }

    fn from_value(value: &Value, heap: &Heap<impl ResourceTracker>, visited: &mut AHashSet<HeapId>) -> Self {
        let Value::Ref(id) = value else {
            return match value {
                Value::None => Self::None,
                Value::Bool(b) => Self::Bool(*b),
                Value::Int(i) => Self::Int(*i),
                Value::Float(f) => Self::Float(*f),
                _ => Self::Repr(value.py_repr(heap)),
            };
        };
        if !visited.insert(*id) {
            return Self::Cycle(
                match heap.get(*id) {
                    HeapData::List(_) => "[...]",
                    HeapData::Tuple(_) => "(...)",
                    HeapData::Dict(_) => "{...}",
                    _ => "...",
                }
                .to_owned(),
            );
        }
        let convert_all = |items: &[Value], visited: &mut AHashSet<HeapId>| -> Vec<Self> {
            items.iter().map(|item| Self::from_value(item, heap, visited)).collect()
        };
        let object = match heap.get(*id) {
            HeapData::Str(s) => Self::Str(s.clone()),
            HeapData::List(items) => Self::List(convert_all(items, visited)),
            HeapData::Tuple(items) => Self::Tuple(convert_all(items, visited)),
            HeapData::Dict(dict) => Self::Dict(
                dict.iter()
                    .map(|(k, v)| (Self::from_value(k, heap, visited), Self::from_value(v, heap, visited)))
                    .collect(),
            ),
            HeapData::Set(set) => Self::Set(set.iter().map(|item| Self::from_value(item, heap, visited)).collect()),
            HeapData::Exception(exc) => Self::Exception {
                exc_type: exc.exc_type,
                arg: exc.first_arg().map(|arg| arg.py_str(heap)),
            },
            _ => Self::Repr(value.py_repr(heap)),
        };
        visited.remove(id);
        object
    }

    /// Python's `repr()` of the value.
    #[must_use]
    pub fn py_repr(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.repr_fmt(&mut out);
        out
    }

    fn repr_fmt(&self, f: &mut impl Write) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => f.write_str(&float_repr(*v)),
            Self::Str(s) => {
                let mut quoted = String::with_capacity(s.len() + 2);
                string_repr_into(&mut quoted, s);
                f.write_str(&quoted)
            }
            Self::List(items) => {
                f.write_char('[')?;
                write_items(f, items)?;
                f.write_char(']')
            }
            Self::Tuple(items) => {
                f.write_char('(')?;
                write_items(f, items)?;
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            Self::Dict(pairs) => {
                f.write_char('{')?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    k.repr_fmt(f)?;
                    f.write_str(": ")?;
                    v.repr_fmt(f)?;
                }
                f.write_char('}')
            }
            Self::Set(items) if items.is_empty() => f.write_str("set()"),
            Self::Set(items) => {
                f.write_char('{')?;
                write_items(f, items)?;
                f.write_char('}')
            }
            Self::Exception { exc_type, arg } => {
                write!(f, "{exc_type}(")?;
                if let Some(arg) = arg {
                    Self::Str(arg.clone()).repr_fmt(f)?;
                }
                f.write_char(')')
            }
            Self::Repr(s) | Self::Cycle(s) => f.write_str(s),
        }
    }
}

fn write_items(f: &mut impl Write, items: &[Object]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        item.repr_fmt(f)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Object;
    use crate::{heap::Heap, resource::NoLimitTracker, value::Value};

    #[test]
    fn display_is_str_and_repr_quotes() {
        let tuple = Object::Tuple(vec![Object::Str("a".to_owned())]);
        assert_eq!(tuple.to_string(), "('a',)");
        assert_eq!(Object::Str("a".to_owned()).to_string(), "a");
        assert_eq!(Object::Set(vec![]).to_string(), "set()");
        assert_eq!(Object::Float(2.0).to_string(), "2.0");
        let dict = Object::Dict(vec![(Object::Str("k".to_owned()), Object::None)]);
        assert_eq!(dict.py_repr(), "{'k': None}");
    }

    #[test]
    fn self_referencing_list_becomes_cycle() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let list = heap.alloc_list(Vec::new()).unwrap();
        let Value::Ref(id) = &list else { panic!("list is a heap value") };
        let id = *id;
        heap.inc_ref(id);
        if let crate::heap::HeapData::List(items) = heap.get_mut(id) {
            items.push(Value::Ref(id));
        }
        let object = Object::new(list, &mut heap);
        assert_eq!(object.to_string(), "[[...]]");
    }
}
