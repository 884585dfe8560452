//! `int()`, `float()`, `str()`, `bool()` and `repr()`.

use super::{at_most, one_arg};
use crate::{
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
    value::{Value, string_repr_into},
};

pub(super) fn builtin_repr(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let value = one_arg(heap, "repr", args)?;
    let text = value.py_repr(heap);
    value.drop_with_heap(heap);
    Ok(heap.alloc_str(text)?)
}

pub(super) fn builtin_str(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let args = at_most(heap, "str", args, 1)?;
    let Some(value) = args.into_iter().next() else {
        return Ok(heap.alloc_str("")?);
    };
    if value.is_str(heap) {
        return Ok(value);
    }
    let text = value.py_str(heap);
    value.drop_with_heap(heap);
    Ok(heap.alloc_str(text)?)
}

pub(super) fn builtin_bool(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let args = at_most(heap, "bool", args, 1)?;
    let truth = args.first().is_some_and(|value| value.py_bool(heap));
    args.drop_with_heap(heap);
    Ok(Value::Bool(truth))
}

/// `int(x=0)` or `int(str, base)`.
pub(super) fn builtin_int(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let args = at_most(heap, "int", args, 2)?;
    let mut args = args.into_iter();
    let (value, base) = (args.next(), args.next());
    let result = match (&value, &base) {
        (None, _) => Ok(Value::Int(0)),
        (Some(value), None) => int_from(heap, value),
        (Some(value), Some(base)) => match (value.as_str(heap), base.as_index()) {
            (Some(text), Some(base)) => parse_int(text, base).map(Value::Int),
            (None, Some(_)) => Err(ExcType::type_error("int() can't convert non-string with explicit base")),
            (_, None) => Err(ExcType::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                base.type_name(heap)
            ))),
        },
    };
    [value, base].drop_with_heap(heap);
    result
}

fn int_from(heap: &Heap<impl ResourceTracker>, value: &Value) -> RunResult<Value> {
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => float_to_int(*f).map(Value::Int),
        _ => match value.as_str(heap) {
            Some(text) => parse_int(text, 10).map(Value::Int),
            None => Err(ExcType::type_error(format!(
                "int() argument must be a string, a bytes-like object or a number, not '{}'",
                value.type_name(heap)
            ))),
        },
    }
}

#[expect(clippy::cast_possible_truncation, reason = "range checked before the cast")]
fn float_to_int(f: f64) -> RunResult<i64> {
    if f.is_nan() {
        return Err(ExcType::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(ExcType::overflow("cannot convert float infinity to integer"));
    }
    let truncated = f.trunc();
    if truncated < -9_223_372_036_854_775_808.0 || truncated >= 9_223_372_036_854_775_808.0 {
        return Err(ExcType::overflow("int too large to convert"));
    }
    Ok(truncated as i64)
}

/// Drops `_` separators that sit between two digits; `None` for any other placement.
fn strip_underscores(digits: &str) -> Option<String> {
    if !digits.contains('_') {
        return Some(digits.to_owned());
    }
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::with_capacity(digits.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' {
            let between = i > 0
                && chars[i - 1].is_ascii_alphanumeric()
                && chars.get(i + 1).is_some_and(char::is_ascii_alphanumeric);
            if !between {
                return None;
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Parses an int literal the way `int(text, base)` does, including base 0 prefixes.
fn parse_int(text: &str, base: i64) -> RunResult<i64> {
    if base != 0 && !(2..=36).contains(&base) {
        return Err(ExcType::value_error("int() base must be >= 2 and <= 36"));
    }
    let invalid = || -> RunError {
        let mut repr = String::new();
        string_repr_into(&mut repr, text);
        SimpleException::new_msg(
            ExcType::ValueError,
            format!("invalid literal for int() with base {base}: {repr}"),
        )
        .into()
    };
    let trimmed = text.trim();
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = unsigned.to_ascii_lowercase();
    let prefixed = |prefix: &str, radix: u32| lower.strip_prefix(prefix).map(|rest| (rest.trim_start_matches('_').to_owned(), radix));
    let (digits, radix) = match base {
        0 => prefixed("0x", 16)
            .or_else(|| prefixed("0o", 8))
            .or_else(|| prefixed("0b", 2))
            .unwrap_or_else(|| (lower.clone(), 10)),
        16 => prefixed("0x", 16).unwrap_or_else(|| (lower.clone(), 16)),
        8 => prefixed("0o", 8).unwrap_or_else(|| (lower.clone(), 8)),
        2 => prefixed("0b", 2).unwrap_or_else(|| (lower.clone(), 2)),
        _ => (lower.clone(), u32::try_from(base).map_err(|_| invalid())?),
    };
    let digits = strip_underscores(&digits).ok_or_else(invalid)?;
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(invalid());
    }
    // base 0 rejects leading zeros on non-zero decimals
    if base == 0 && radix == 10 && digits.len() > 1 && digits.starts_with('0') && digits.bytes().any(|b| b != b'0') {
        return Err(invalid());
    }
    let magnitude = u64::from_str_radix(&digits, radix).map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow => ExcType::overflow("int too large to convert"),
        _ => invalid(),
    })?;
    let value = if negative {
        0i64.checked_sub_unsigned(magnitude)
    } else {
        i64::try_from(magnitude).ok()
    };
    value.ok_or_else(|| ExcType::overflow("int too large to convert"))
}

/// `float(x=0.0)`.
pub(super) fn builtin_float(heap: &mut Heap<impl ResourceTracker>, args: Vec<Value>) -> RunResult<Value> {
    let args = at_most(heap, "float", args, 1)?;
    let Some(value) = args.into_iter().next() else {
        return Ok(Value::Float(0.0));
    };
    let result = match &value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        _ => match value.as_str(heap) {
            Some(text) => parse_float(text),
            None => Err(ExcType::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                value.type_name(heap)
            ))),
        },
    };
    value.drop_with_heap(heap);
    result.map(Value::Float)
}

fn parse_float(text: &str) -> RunResult<f64> {
    let trimmed = text.trim();
    let unsigned = trimmed.trim_start_matches(['+', '-']);
    let special = matches!(
        unsigned.to_ascii_lowercase().as_str(),
        "inf" | "infinity" | "nan"
    );
    let parsed = if special {
        trimmed.parse::<f64>().ok()
    } else if unsigned.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-' | '_')) {
        strip_underscores(trimmed).and_then(|digits| digits.parse::<f64>().ok())
    } else {
        None
    };
    parsed.ok_or_else(|| {
        let mut repr = String::new();
        string_repr_into(&mut repr, text);
        SimpleException::new_msg(ExcType::ValueError, format!("could not convert string to float: {repr}")).into()
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{parse_float, parse_int};

    #[test]
    fn parse_int_handles_prefixes_and_separators() {
        assert_eq!(parse_int(" -42 ", 10).unwrap(), -42);
        assert_eq!(parse_int("0x_ff", 0).unwrap(), 255);
        assert_eq!(parse_int("1_000", 10).unwrap(), 1000);
        assert_eq!(parse_int("z", 36).unwrap(), 35);
        assert!(parse_int("010", 0).is_err());
        assert!(parse_int("1__0", 10).is_err());
        assert!(parse_int("", 10).is_err());
    }

    #[test]
    fn parse_float_accepts_specials() {
        assert_eq!(parse_float("  1.5e3 ").unwrap(), 1500.0);
        assert!(parse_float("-inf").unwrap().is_infinite());
        assert!(parse_float("NaN").unwrap().is_nan());
        assert!(parse_float("1.2.3").is_err());
        assert!(parse_float("abc").is_err());
    }
}
