//! Implementation of the print() builtin function.

use crate::{
    bytecode::vm::{CallArgs, VM},
    exception_private::{ExcType, RunResult},
    heap::DropWithHeap,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `print(*objects, sep=' ', end='\n', flush=False)`.
    ///
    /// `file` is accepted only as `None`; output always goes to the print writer.
    pub(super) fn builtin_print(&mut self, call: CallArgs) -> RunResult<Value> {
        let CallArgs { args, kwargs } = call;
        let mut sep: Option<String> = None;
        let mut end: Option<String> = None;
        let mut failure = None;
        for (key, value) in kwargs {
            if failure.is_none() {
                let parsed = match key.as_str(self.heap) {
                    Some("sep") => self.print_text_option("sep", &value).map(|text| sep = text),
                    Some("end") => self.print_text_option("end", &value).map(|text| end = text),
                    Some("flush") => Ok(()),
                    Some("file") if value.is_none() => Ok(()),
                    Some("file") => Err(ExcType::type_error("print() file must be None")),
                    Some(other) => Err(ExcType::type_error(format!(
                        "'{other}' is an invalid keyword argument for this function"
                    ))),
                    None => Err(ExcType::type_error_keywords_must_be_strings("print")),
                };
                failure = parsed.err();
            }
            [key, value].drop_with_heap(self.heap);
        }
        if let Some(err) = failure {
            args.drop_with_heap(self.heap);
            return Err(err);
        }

        let mut args = args.into_iter();
        let mut result = Ok(());
        for (i, value) in args.by_ref().enumerate() {
            let text = value.py_str(self.heap);
            value.drop_with_heap(self.heap);
            result = self.write_separator(i, sep.as_deref()).and_then(|()| self.print.write_text(text.into()));
            if result.is_err() {
                break;
            }
        }
        args.collect::<Vec<_>>().drop_with_heap(self.heap);
        result?;
        match end {
            Some(end) => self.print.write_text(end.into())?,
            None => self.print.write_char('\n')?,
        }
        Ok(Value::None)
    }

    fn write_separator(&mut self, index: usize, sep: Option<&str>) -> Result<(), crate::Exception> {
        match (index, sep) {
            (0, _) => Ok(()),
            (_, Some(sep)) => self.print.write_text(sep.to_owned().into()),
            (_, None) => self.print.write_char(' '),
        }
    }

    /// `sep`/`end`: a string, or `None` for the default.
    fn print_text_option(&self, name: &str, value: &Value) -> RunResult<Option<String>> {
        if value.is_none() {
            return Ok(None);
        }
        match value.as_str(self.heap) {
            Some(text) => Ok(Some(text.to_owned())),
            None => Err(ExcType::type_error(format!(
                "{name} must be None or a string, not {}",
                value.type_name(self.heap)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{CodeBuilder, CollectStringPrint, NoLimitTracker, NoopTracer, Opcode, Runner};

    #[test]
    fn print_joins_with_sep_and_end() {
        let mut b = CodeBuilder::module("<test>");
        b.load_name("print");
        b.load_const(1);
        b.load_const("a");
        b.load_const("-");
        b.load_const("!\n");
        b.load_const(crate::Const::Tuple(vec!["sep".into(), "end".into()]));
        b.emit_arg(Opcode::CallFunctionKw, 4);
        b.return_value();
        let mut print = CollectStringPrint::new();
        let result = Runner::new(b.build()).run(NoLimitTracker, &mut print, &mut NoopTracer, None);
        assert_eq!(result.unwrap(), crate::Object::None);
        assert_eq!(print.output(), "1-a!\n");
    }
}
