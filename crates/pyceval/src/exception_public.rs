use std::fmt;

use crate::{
    exception_private::{ExcType, ExceptionRaise, RaisedValue, RunError, SimpleException, TraceFrame},
    heap::{Heap, HeapData, HeapId},
    resource::ResourceTracker,
    value::{Value, string_repr_into},
};

/// Exception chains longer than this are cut when converting to [`Exception`].
const MAX_CHAIN: usize = 32;

/// An exception that escaped evaluation, detached from the heap.
///
/// The traceback lists one entry per activation the exception unwound through,
/// outermost first (the order CPython prints them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    exc_type: ExcType,
    message: Option<String>,
    traceback: Vec<TraceFrame>,
    cause: Option<Box<Exception>>,
    context: Option<Box<Exception>>,
}

impl Exception {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            exc_type,
            message,
            traceback: Vec::new(),
            cause: None,
            context: None,
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    /// `str()` of the exception, `None` when it was raised without arguments.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn traceback(&self) -> &[TraceFrame] {
        &self.traceback
    }

    /// The exception named by `raise ... from cause`.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }

    /// The exception that was being handled when this one was raised, unless suppressed.
    #[must_use]
    pub fn context(&self) -> Option<&Self> {
        self.context.as_deref()
    }

    /// The last line of a printed traceback, e.g. `ValueError: bad value`.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.message.as_deref() {
            Some(msg) if !msg.is_empty() => format!("{}: {msg}", self.exc_type),
            _ => self.exc_type.to_string(),
        }
    }

    /// Converts an evaluation error, releasing every heap reference it holds.
    pub(crate) fn from_run_error(err: RunError, heap: &mut Heap<impl ResourceTracker>) -> Self {
        match err {
            RunError::Internal(msg) => Self::new(ExcType::SystemError, Some(format!("internal error: {msg}"))),
            RunError::Exc(raise) | RunError::UncatchableExc(raise) => Self::from_raise(*raise, heap),
        }
    }

    fn from_raise(raise: ExceptionRaise, heap: &mut Heap<impl ResourceTracker>) -> Self {
        let ExceptionRaise { value, traceback, .. } = raise;
        let mut exc = match &value {
            RaisedValue::Simple(simple) if simple.exc_type() == ExcType::KeyError => {
                let quoted = simple.arg().map(|key| {
                    let mut out = String::new();
                    string_repr_into(&mut out, key);
                    out
                });
                Self::new(ExcType::KeyError, quoted)
            }
            RaisedValue::Simple(simple) => Self::new(simple.exc_type(), simple.arg().map(str::to_owned)),
            RaisedValue::Instance(id) => Self::from_instance(*id, heap, MAX_CHAIN),
        };
        exc.traceback = traceback.into_iter().rev().collect();
        if let RaisedValue::Instance(id) = value {
            heap.dec_ref(id);
        }
        exc
    }

    fn from_instance(id: HeapId, heap: &Heap<impl ResourceTracker>, budget: usize) -> Self {
        let HeapData::Exception(obj) = heap.get(id) else {
            return Self::new(ExcType::SystemError, Some("exception is not an exception instance".to_owned()));
        };
        let message = if obj.args.is_empty() {
            None
        } else {
            Some(obj.str_value(heap))
        };
        let mut exc = Self::new(obj.exc_type, message);
        exc.traceback = traceback_frames(&obj.traceback, heap);
        if budget > 0 {
            exc.cause = chained(&obj.cause, heap, budget - 1);
            if !obj.suppress_context {
                exc.context = chained(&obj.context, heap, budget - 1);
            }
        }
        exc
    }
}

fn chained(value: &Value, heap: &Heap<impl ResourceTracker>, budget: usize) -> Option<Box<Exception>> {
    match value {
        Value::Ref(id) if matches!(heap.get(*id), HeapData::Exception(_)) => {
            Some(Box::new(Exception::from_instance(*id, heap, budget)))
        }
        Value::ExcClass(exc_type) => Some(Box::new(Exception::new(*exc_type, None))),
        _ => None,
    }
}

/// Frames of a heap traceback, outermost first.
fn traceback_frames(value: &Value, heap: &Heap<impl ResourceTracker>) -> Vec<TraceFrame> {
    match value {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Traceback(frames) => frames.iter().rev().cloned().collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cause) = &self.cause {
            write!(f, "{cause}")?;
            f.write_str("\nThe above exception was the direct cause of the following exception:\n\n")?;
        } else if let Some(context) = &self.context {
            write!(f, "{context}")?;
            f.write_str("\nDuring handling of the above exception, another exception occurred:\n\n")?;
        }
        if !self.traceback.is_empty() {
            f.write_str("Traceback (most recent call last):\n")?;
            for frame in &self.traceback {
                writeln!(f, "  File \"{}\", line {}, in {}", frame.filename, frame.line, frame.name)?;
            }
        }
        writeln!(f, "{}", self.summary())
    }
}

impl std::error::Error for Exception {}

/// Lets host callbacks (print writers) fail with a Python exception.
impl From<Exception> for RunError {
    fn from(exc: Exception) -> Self {
        SimpleException::new(exc.exc_type, exc.message).into()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn display_matches_cpython_layout() {
        let mut heap = Heap::new(0, NoLimitTracker);
        let mut raise: ExceptionRaise = SimpleException::new_msg(ExcType::ValueError, "bad").into();
        raise.traceback.push(TraceFrame {
            filename: "<input>".to_owned(),
            name: "inner".to_owned(),
            line: 7,
        });
        raise.traceback.push(TraceFrame {
            filename: "<input>".to_owned(),
            name: "<module>".to_owned(),
            line: 2,
        });
        let exc = Exception::from_run_error(RunError::Exc(Box::new(raise)), &mut heap);
        assert_eq!(
            exc.to_string(),
            "Traceback (most recent call last):\n  File \"<input>\", line 2, in <module>\n  File \"<input>\", line 7, in inner\nValueError: bad\n"
        );
        assert_eq!(exc.traceback()[0].name, "<module>");
    }

    #[test]
    fn summary_without_message() {
        let exc = Exception::new(ExcType::StopIteration, None);
        assert_eq!(exc.summary(), "StopIteration");
        let exc = Exception::new(ExcType::KeyError, Some("'k'".to_owned()));
        assert_eq!(exc.summary(), "KeyError: 'k'");
    }
}
