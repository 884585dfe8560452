use std::{
    borrow::Cow,
    io::{self, Write as _},
};

use crate::{exception_private::ExcType, exception_public::Exception};

/// Destination for `print()` and for the echo of `PRINT_EXPR`.
///
/// `print(a, b)` arrives as `write_text(a)`, `write_char(' ')`, `write_text(b)`,
/// `write_char('\n')`; a custom `sep` or `end` comes through `write_text`.
pub trait PrintWriter {
    fn write_text(&mut self, text: Cow<'_, str>) -> Result<(), Exception>;

    /// A single separator or line terminator.
    fn write_char(&mut self, ch: char) -> Result<(), Exception>;
}

/// Writes to the process stdout, flushing at each line terminator.
#[derive(Debug)]
pub struct StdPrint;

fn os_error(err: &io::Error) -> Exception {
    Exception::new(ExcType::OSError, Some(err.to_string()))
}

impl PrintWriter for StdPrint {
    fn write_text(&mut self, text: Cow<'_, str>) -> Result<(), Exception> {
        io::stdout().lock().write_all(text.as_bytes()).map_err(|e| os_error(&e))
    }

    fn write_char(&mut self, ch: char) -> Result<(), Exception> {
        let mut stdout = io::stdout().lock();
        let mut buf = [0; 4];
        stdout.write_all(ch.encode_utf8(&mut buf).as_bytes()).map_err(|e| os_error(&e))?;
        if ch == '\n' {
            stdout.flush().map_err(|e| os_error(&e))?;
        }
        Ok(())
    }
}

/// Collects everything printed into a `String`.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_text(&mut self, text: Cow<'_, str>) -> Result<(), Exception> {
        self.0.push_str(&text);
        Ok(())
    }

    fn write_char(&mut self, ch: char) -> Result<(), Exception> {
        self.0.push(ch);
        Ok(())
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_text(&mut self, _text: Cow<'_, str>) -> Result<(), Exception> {
        Ok(())
    }

    fn write_char(&mut self, _ch: char) -> Result<(), Exception> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_keeps_text_and_separators_in_order() {
        let mut print = CollectStringPrint::new();
        print.write_text("a".into()).unwrap();
        print.write_char(' ').unwrap();
        print.write_text(String::from("b").into()).unwrap();
        print.write_char('\n').unwrap();
        assert_eq!(print.into_output(), "a b\n");
    }
}
