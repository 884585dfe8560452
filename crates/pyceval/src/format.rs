//! String formatting: the format mini-language used by `FORMAT_VALUE` and
//! `format()`, printf-style `%` formatting, and `ascii()`.

use std::{fmt::Write, str::FromStr};

use crate::{
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData},
    resource::ResourceTracker,
    types::HashKey,
    value::{Value, float_repr},
};

/// Parsed `[[fill]align][sign][#][0][width][,][.precision][type]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedFormatSpec {
    pub fill: char,
    pub align: Option<char>,
    pub sign: Option<char>,
    pub alternate: bool,
    pub zero_pad: bool,
    pub width: usize,
    pub grouping: bool,
    pub precision: Option<usize>,
    pub type_char: Option<char>,
}

impl Default for ParsedFormatSpec {
    fn default() -> Self {
        Self {
            fill: ' ',
            align: None,
            sign: None,
            alternate: false,
            zero_pad: false,
            width: 0,
            grouping: false,
            precision: None,
            type_char: None,
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits.parse().ok()
}

impl FromStr for ParsedFormatSpec {
    type Err = String;

    /// The error carries the offending spec for the `Invalid format specifier` message.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut result = Self::default();
        let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
        let mut head = spec.chars();
        let (first, second) = (head.next(), head.next());
        let mut chars = spec.chars().peekable();
        if second.is_some_and(is_align) {
            result.fill = first.unwrap_or(' ');
            chars.next();
            result.align = chars.next();
        } else if first.is_some_and(is_align) {
            result.align = chars.next();
        }
        if let Some(sign) = chars.next_if(|c| matches!(*c, '+' | '-' | ' ')) {
            result.sign = Some(sign);
        }
        result.alternate = chars.next_if_eq(&'#').is_some();
        if chars.next_if_eq(&'0').is_some() {
            result.zero_pad = true;
        }
        result.width = take_digits(&mut chars).unwrap_or(0);
        result.grouping = chars.next_if(|c| matches!(*c, ',' | '_')).is_some();
        if chars.next_if_eq(&'.').is_some() {
            result.precision = Some(take_digits(&mut chars).ok_or_else(|| "Format specifier missing precision".to_owned())?);
        }
        result.type_char = chars.next_if(|c| "sdfFeEgGn%boxXc".contains(*c));
        if chars.peek().is_some() {
            return Err(format!("Invalid format specifier '{spec}'"));
        }
        Ok(result)
    }
}

/// `format(value, spec)` for built-in types.
#[expect(clippy::cast_precision_loss, reason = "int formatted with a float presentation type")]
pub(crate) fn format_value(heap: &Heap<impl ResourceTracker>, value: &Value, spec: &str) -> RunResult<String> {
    if spec.is_empty() {
        return Ok(value.py_str(heap));
    }
    let parsed: ParsedFormatSpec = spec.parse().map_err(ExcType::value_error)?;
    let type_name = value.type_name(heap);
    let unknown = |c: char| ExcType::value_error(format!("Unknown format code '{c}' for object of type '{type_name}'"));
    match (value, parsed.type_char) {
        (Value::Int(n), None | Some('d' | 'n')) => Ok(format_int(*n, &parsed)),
        (Value::Bool(b), Some('d' | 'n')) => Ok(format_int(i64::from(*b), &parsed)),
        (Value::Int(n), Some(c @ ('b' | 'o' | 'x' | 'X'))) => Ok(format_int_base(*n, c, &parsed)),
        (Value::Int(n), Some('c')) => {
            let c = u32::try_from(*n)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| ExcType::overflow("%c arg not in range(0x110000)"))?;
            Ok(pad(&c.to_string(), &parsed, '<'))
        }
        (Value::Int(n), Some(c @ ('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%'))) => Ok(format_float(*n as f64, c, &parsed)),
        (Value::Float(f), None) if parsed.precision.is_none() => Ok(with_sign(float_repr(*f), *f, &parsed)),
        (Value::Float(f), None) => Ok(format_float(*f, 'g', &parsed)),
        (Value::Float(f), Some(c @ ('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%' | 'n'))) => {
            Ok(format_float(*f, if c == 'n' { 'g' } else { c }, &parsed))
        }
        (_, None | Some('s')) if value.is_str(heap) || parsed.type_char.is_none() => {
            if parsed.align == Some('=') {
                return Err(ExcType::value_error("'=' alignment not allowed in string format specifier"));
            }
            if parsed.sign.is_some() && value.is_str(heap) {
                return Err(ExcType::value_error("Sign not allowed in string format specifier"));
            }
            let mut s = value.py_str(heap);
            if let Some(precision) = parsed.precision {
                s = s.chars().take(precision).collect();
            }
            Ok(pad(&s, &parsed, '<'))
        }
        (_, Some(c)) => Err(unknown(c)),
        (_, None) => Err(unknown('s')),
    }
}

/// Pads to the spec width; `=` puts the fill between sign and digits.
fn pad(body: &str, spec: &ParsedFormatSpec, default_align: char) -> String {
    let len = body.chars().count();
    if spec.width <= len {
        return body.to_owned();
    }
    let padding = spec.width - len;
    let (fill, align) = if spec.zero_pad && spec.align.is_none() {
        ('0', '=')
    } else {
        (spec.fill, spec.align.unwrap_or(default_align))
    };
    let fill_n = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
    match align {
        '<' => format!("{body}{}", fill_n(padding)),
        '^' => format!("{}{body}{}", fill_n(padding / 2), fill_n(padding - padding / 2)),
        '=' => {
            let split = body.find(|c: char| !matches!(c, '+' | '-' | ' ')).unwrap_or(0);
            let (sign, rest) = body.split_at(split);
            let (prefix, digits) = if rest.starts_with("0x") || rest.starts_with("0o") || rest.starts_with("0b") {
                rest.split_at(2)
            } else {
                ("", rest)
            };
            format!("{sign}{prefix}{}{digits}", fill_n(padding))
        }
        _ => format!("{}{body}", fill_n(padding)),
    }
}

fn sign_prefix(negative: bool, spec: &ParsedFormatSpec) -> &'static str {
    match (negative, spec.sign) {
        (true, _) => "-",
        (false, Some('+')) => "+",
        (false, Some(' ')) => " ",
        _ => "",
    }
}

fn with_sign(body: String, f: f64, spec: &ParsedFormatSpec) -> String {
    let body = if f.is_sign_negative() || f.is_nan() {
        body
    } else {
        format!("{}{body}", sign_prefix(false, spec))
    };
    pad(&body, spec, '>')
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_int(n: i64, spec: &ParsedFormatSpec) -> String {
    let mut digits = n.unsigned_abs().to_string();
    if spec.grouping {
        digits = group_thousands(&digits);
    }
    pad(&format!("{}{digits}", sign_prefix(n < 0, spec)), spec, '>')
}

fn format_int_base(n: i64, base: char, spec: &ParsedFormatSpec) -> String {
    let abs = n.unsigned_abs();
    let (digits, prefix) = match base {
        'b' => (format!("{abs:b}"), "0b"),
        'o' => (format!("{abs:o}"), "0o"),
        'X' => (format!("{abs:X}"), "0X"),
        _ => (format!("{abs:x}"), "0x"),
    };
    let prefix = if spec.alternate { prefix } else { "" };
    pad(&format!("{}{prefix}{digits}", sign_prefix(n < 0, spec)), spec, '>')
}

fn format_float(f: f64, kind: char, spec: &ParsedFormatSpec) -> String {
    let precision = spec.precision.unwrap_or(6);
    let upper = kind.is_ascii_uppercase();
    let abs = f.abs();
    let mut body = if f.is_nan() {
        "nan".to_owned()
    } else if f.is_infinite() {
        "inf".to_owned()
    } else {
        match kind {
            'e' | 'E' => exponent_form(abs, precision),
            '%' => format!("{:.precision$}%", abs * 100.0),
            'g' | 'G' => general_form(abs, precision.max(1), spec.alternate),
            _ => format!("{abs:.precision$}"),
        }
    };
    if spec.grouping && !f.is_nan() && !f.is_infinite() {
        let split = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
        body = format!("{}{}", group_thousands(&body[..split]), &body[split..]);
    }
    if upper {
        body = body.to_uppercase();
    }
    let negative = f.is_sign_negative() && !f.is_nan();
    pad(&format!("{}{body}", sign_prefix(negative, spec)), spec, '>')
}

/// `1.500000e+03` style with a signed two-digit exponent.
fn exponent_form(abs: f64, precision: usize) -> String {
    let raw = format!("{abs:.precision$e}");
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let (sign, digits) = match exp.strip_prefix('-') {
        Some(d) => ('-', d),
        None => ('+', exp),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}

/// The `g` presentation: fixed or exponent form depending on magnitude, trailing zeros removed.
fn general_form(abs: f64, precision: usize, keep_zeros: bool) -> String {
    if abs == 0.0 {
        return if keep_zeros {
            format!("{:.*}", precision - 1, 0.0)
        } else {
            "0".to_owned()
        };
    }
    let sci = exponent_form(abs, precision - 1);
    let exp: i64 = sci.split_once('e').and_then(|(_, e)| e.parse().ok()).unwrap_or(0);
    let precision_i = i64::try_from(precision).unwrap_or(i64::MAX);
    let body = if exp < -4 || exp >= precision_i {
        sci
    } else {
        let decimals = usize::try_from(precision_i - 1 - exp).unwrap_or(0);
        format!("{abs:.decimals$}")
    };
    if keep_zeros {
        return body;
    }
    let (mantissa, exp_part) = match body.split_once('e') {
        Some((m, e)) => (m.to_owned(), format!("e{e}")),
        None => (body.clone(), String::new()),
    };
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.').to_owned()
    } else {
        mantissa
    };
    format!("{mantissa}{exp_part}")
}

/// `ascii(value)`: `repr()` with non-ASCII characters escaped.
pub(crate) fn ascii(heap: &Heap<impl ResourceTracker>, value: &Value) -> String {
    let repr = value.py_repr(heap);
    let mut out = String::with_capacity(repr.len());
    for c in repr.chars() {
        let code = c as u32;
        match code {
            0..=0x7f => out.push(c),
            0x80..=0xff => {
                let _ = write!(out, "\\x{code:02x}");
            }
            0x100..=0xffff => {
                let _ = write!(out, "\\u{code:04x}");
            }
            _ => {
                let _ = write!(out, "\\U{code:08x}");
            }
        }
    }
    out
}

// ============================================================================
// printf-style formatting
// ============================================================================

/// Where `%` conversions take their arguments from.
#[derive(Clone, Copy)]
enum PercentArgs<'a> {
    Seq(&'a [Value], usize),
    Map(&'a crate::types::Dict),
    Single(&'a Value, bool),
}

impl<'a> PercentArgs<'a> {
    fn next(&mut self) -> RunResult<&'a Value> {
        let exhausted = || ExcType::type_error("not enough arguments for format string");
        match self {
            Self::Seq(items, pos) => {
                let items: &'a [Value] = items;
                let item = items.get(*pos).ok_or_else(exhausted)?;
                *pos += 1;
                Ok(item)
            }
            Self::Single(value, used) => {
                if *used {
                    return Err(exhausted());
                }
                *used = true;
                Ok(*value)
            }
            Self::Map(_) => Err(ExcType::type_error("format requires a mapping")),
        }
    }

    fn unused(&self) -> bool {
        match self {
            Self::Seq(items, pos) => *pos < items.len(),
            Self::Single(_, used) => !*used,
            Self::Map(_) => false,
        }
    }
}

/// `template % args`.
pub(crate) fn percent_format(heap: &Heap<impl ResourceTracker>, template: &str, args: &Value) -> RunResult<String> {
    let mut source = match args.ref_id().map(|id| heap.get(id)) {
        Some(HeapData::Tuple(items)) => PercentArgs::Seq(items, 0),
        Some(HeapData::Dict(d)) => PercentArgs::Map(d),
        _ => PercentArgs::Single(args, false),
    };
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.next_if_eq(&'%').is_some() {
            out.push('%');
            continue;
        }
        let arg = if chars.next_if_eq(&'(').is_some() {
            let key: String = chars.by_ref().take_while(|c| *c != ')').collect();
            let PercentArgs::Map(d) = source else {
                return Err(ExcType::type_error("format requires a mapping"));
            };
            Some(d.get(&HashKey::str(&key)).ok_or_else(|| ExcType::key_error_str(&key))?)
        } else {
            None
        };
        let mut spec = ParsedFormatSpec::default();
        while let Some(flag) = chars.next_if(|c| matches!(*c, '-' | '+' | ' ' | '#' | '0')) {
            match flag {
                '-' => spec.align = Some('<'),
                '+' | ' ' if spec.sign != Some('+') => spec.sign = Some(flag),
                '#' => spec.alternate = true,
                '0' => spec.zero_pad = true,
                _ => {}
            }
        }
        if chars.next_if_eq(&'*').is_some() {
            spec.width = usize::try_from(source.next()?.as_index().ok_or_else(|| ExcType::type_error("* wants int"))?)
                .unwrap_or(0);
        } else {
            spec.width = take_digits(&mut chars).unwrap_or(0);
        }
        if chars.next_if_eq(&'.').is_some() {
            spec.precision = Some(take_digits(&mut chars).unwrap_or(0));
        }
        if spec.align == Some('<') {
            spec.zero_pad = false;
        }
        let Some(conversion) = chars.next() else {
            return Err(ExcType::value_error("incomplete format"));
        };
        let arg = match arg {
            Some(arg) => arg,
            None => source.next()?,
        };
        out.push_str(&percent_one(heap, conversion, arg, &spec, out.len())?);
    }
    if source.unused() {
        return Err(ExcType::type_error("not all arguments converted during string formatting"));
    }
    Ok(out)
}

#[expect(clippy::cast_possible_truncation, reason = "%d truncates floats toward zero")]
fn percent_one(
    heap: &Heap<impl ResourceTracker>,
    conversion: char,
    arg: &Value,
    spec: &ParsedFormatSpec,
    position: usize,
) -> RunResult<String> {
    let number_required = |kind: &str| {
        ExcType::type_error(format!(
            "%{conversion} format: {kind} is required, not {}",
            arg.type_name(heap)
        ))
    };
    match conversion {
        's' | 'r' | 'a' => {
            let mut s = match conversion {
                's' => arg.py_str(heap),
                'r' => arg.py_repr(heap),
                _ => ascii(heap, arg),
            };
            if let Some(precision) = spec.precision {
                s = s.chars().take(precision).collect();
            }
            Ok(pad(&s, spec, '>'))
        }
        'd' | 'i' | 'u' => match arg {
            Value::Float(f) => Ok(format_int(f.trunc() as i64, spec)),
            other => Ok(format_int(other.as_index().ok_or_else(|| number_required("a number"))?, spec)),
        },
        'x' | 'X' | 'o' => {
            let n = arg.as_index().ok_or_else(|| number_required("an integer"))?;
            Ok(format_int_base(n, conversion, spec))
        }
        'e' | 'E' | 'f' | 'F' | 'g' | 'G' => {
            let f = arg.as_number().ok_or_else(|| number_required("a number"))?.as_f64();
            Ok(format_float(f, conversion, spec))
        }
        'c' => {
            let c = match arg {
                v if v.as_str(heap).is_some_and(|s| s.chars().count() == 1) => v.as_str(heap).unwrap_or_default().to_owned(),
                v => u32::try_from(v.as_index().ok_or_else(|| ExcType::type_error("%c requires int or char"))?)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| ExcType::overflow("%c arg not in range(0x110000)"))?
                    .to_string(),
            };
            Ok(pad(&c, spec, '>'))
        }
        other => Err(ExcType::value_error(format!(
            "unsupported format character '{other}' (0x{:x}) at index {position}",
            other as u32
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resource::NoLimitTracker;

    fn fmt(value: &Value, spec: &str) -> String {
        let heap = Heap::new(0, NoLimitTracker);
        format_value(&heap, value, spec).unwrap()
    }

    #[test]
    fn numbers() {
        assert_eq!(fmt(&Value::Int(42), ">6"), "    42");
        assert_eq!(fmt(&Value::Int(-42), "06"), "-00042");
        assert_eq!(fmt(&Value::Int(1_234_567), ","), "1,234,567");
        assert_eq!(fmt(&Value::Int(255), "#x"), "0xff");
        assert_eq!(fmt(&Value::Float(1.23456), ".2f"), "1.23");
        assert_eq!(fmt(&Value::Float(0.5), ".1%"), "50.0%");
        assert_eq!(fmt(&Value::Float(1234.5), "e"), "1.234500e+03");
        assert_eq!(fmt(&Value::Float(0.000_012_5), "g"), "1.25e-05");
        assert_eq!(fmt(&Value::Float(100.0), "g"), "100");
        assert_eq!(fmt(&Value::Float(2.5), ""), "2.5");
    }

    #[test]
    fn strings_and_errors() {
        let mut heap = Heap::new(2, NoLimitTracker);
        let s = heap.alloc_str("ab").unwrap();
        assert_eq!(format_value(&heap, &s, "*^6").unwrap(), "**ab**");
        assert_eq!(format_value(&heap, &s, ".1").unwrap(), "a");
        assert!(format_value(&heap, &s, "d").is_err());
        assert!(format_value(&heap, &Value::Int(1), "z").is_err());
        s.drop_with_heap(&mut heap);
    }

    #[test]
    fn percent_formatting() {
        let mut heap = Heap::new(4, NoLimitTracker);
        let name = heap.alloc_str("x").unwrap();
        let args = heap.alloc_tuple(vec![name, Value::Int(7), Value::Float(1.5)]).unwrap();
        assert_eq!(
            percent_format(&heap, "%s=%03d (%.2f) 100%%", &args).unwrap(),
            "x=007 (1.50) 100%"
        );
        assert_eq!(percent_format(&heap, "%r", &Value::None).unwrap(), "None");
        assert!(percent_format(&heap, "%d %d", &Value::Int(1)).is_err());
        assert!(percent_format(&heap, "", &Value::Int(1)).is_err());
        args.drop_with_heap(&mut heap);
    }

    #[test]
    fn ascii_escapes() {
        let mut heap = Heap::new(2, NoLimitTracker);
        let s = heap.alloc_str("caf\u{e9}\u{2603}").unwrap();
        assert_eq!(ascii(&heap, &s), "'caf\\xe9\\u2603'");
        s.drop_with_heap(&mut heap);
    }
}
