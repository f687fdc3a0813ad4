//! Public interface for compiling and running Karasu code.

use crate::bytecode::compiler;
use crate::exceptions::{KarasuError, VmErr, VmResult};
use crate::heap::HeapId;
use crate::io::{PrintWriter, StdPrint};
use crate::object::{HeapData, Module};
use crate::value::Value;
use crate::vm::Vm;

/// An interpreter: one VM plus the module it is driving.
///
/// # Example
/// ```
/// use karasu::{Interpreter, SharedPrint};
///
/// let output = SharedPrint::new();
/// let mut interp = Interpreter::with_writer(Box::new(output.handle()));
/// interp.interpret("print(1 + 2)", "example.krs").unwrap();
/// assert_eq!(output.output(), "3\n");
/// ```
pub struct Interpreter {
    vm: Vm,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Interpreter writing to process stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_writer(Box::new(StdPrint))
    }

    /// Interpreter writing through a custom sink.
    #[must_use]
    pub fn with_writer(out: Box<dyn PrintWriter>) -> Self {
        Self { vm: Vm::new(out) }
    }

    #[must_use]
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Compiles without executing; surfaces syntax errors.
    pub fn check(&mut self, source: &str, filename: &str) -> Result<(), KarasuError> {
        compiler::compile(source, filename, &mut self.vm.heap, &mut self.vm.interner)
            .map(|_| ())
            .map_err(|err| KarasuError::from_compile_error(&err))
    }

    /// Compiles and executes `source` as a module named after the filename.
    pub fn interpret(&mut self, source: &str, filename: &str) -> Result<(), KarasuError> {
        let module_name = module_name_from_filename(filename);
        self.run_module(source, filename, &module_name)
    }

    /// Compiles and executes `source` as the entry module (`__main__`).
    pub fn interpret_entry(&mut self, source: &str, filename: &str) -> Result<(), KarasuError> {
        self.run_module(source, filename, "__main__")
    }

    fn run_module(&mut self, source: &str, filename: &str, module_name: &str) -> Result<(), KarasuError> {
        let vm = &mut self.vm;
        match crate::modules::execute_source_module(vm, module_name, source, filename) {
            Ok(_) => Ok(()),
            Err(err) => Err(render_error(vm, err)),
        }
    }
}

fn module_name_from_filename(filename: &str) -> String {
    std::path::Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("<module>")
        .to_owned()
}

/// Renders a `VmErr` into the host-facing error with a full traceback.
pub(crate) fn render_error(vm: &mut Vm, err: VmErr) -> KarasuError {
    match materialized(vm, err) {
        Ok(exc) => {
            let exc_type = exception_type_name(vm, exc);
            let message = vm.value_str(exc).unwrap_or_default();
            let traceback = render_traceback(vm, exc, &exc_type, &message);
            KarasuError {
                exc_type,
                message,
                traceback,
            }
        }
        Err(fallback) => fallback,
    }
}

fn materialized(vm: &mut Vm, err: VmErr) -> Result<Value, KarasuError> {
    vm.materialize_exception(err).map_err(|_| KarasuError {
        exc_type: "SystemError".to_owned(),
        message: "exception construction failed".to_owned(),
        traceback: "SystemError: exception construction failed".to_owned(),
    })
}

fn exception_type_name(vm: &Vm, exc: Value) -> String {
    vm.type_name_of(exc)
}

/// The unhandled-exception report: most recent call last, one line per
/// frame, then `Type: message`.
fn render_traceback(vm: &mut Vm, exc: Value, exc_type: &str, message: &str) -> String {
    let mut out = String::from("Traceback (most recent call last):\n");
    let entries = traceback_entries(vm, exc);
    for (closure, offset) in entries.into_iter().rev() {
        let Some((filename, line, func)) = frame_location(vm, closure, offset) else {
            continue;
        };
        out.push_str(&format!("  File {filename}, line {line}, in {func}\n"));
    }
    if message.is_empty() {
        out.push_str(exc_type);
    } else {
        out.push_str(&format!("{exc_type}: {message}"));
    }
    out
}

fn traceback_entries(vm: &Vm, exc: Value) -> Vec<(HeapId, usize)> {
    let Some(exc_id) = exc.as_ref_id() else {
        return Vec::new();
    };
    let list = match vm.heap.get(exc_id) {
        HeapData::Instance(instance) => instance.fields.get(&vm.names.traceback).copied(),
        _ => None,
    };
    let Some(list_id) = list.and_then(|v| v.as_ref_id()) else {
        return Vec::new();
    };
    let HeapData::List(list) = vm.heap.get(list_id) else {
        return Vec::new();
    };
    let mut entries = Vec::with_capacity(list.items.len());
    for item in &list.items {
        let Some(tuple_id) = item.as_ref_id() else { continue };
        let HeapData::Tuple(tuple) = vm.heap.get(tuple_id) else {
            continue;
        };
        let (Some(Value::Ref(closure)), Some(Value::Int(offset))) =
            (tuple.items.first().copied(), tuple.items.get(1).copied())
        else {
            continue;
        };
        entries.push((closure, offset.max(0) as usize));
    }
    entries
}

fn frame_location(vm: &Vm, closure: HeapId, offset: usize) -> Option<(String, u32, String)> {
    let HeapData::Closure(closure_data) = vm.heap.get(closure) else {
        return None;
    };
    let HeapData::Code(code) = vm.heap.get(closure_data.code) else {
        return None;
    };
    let filename = vm.name_str(code.filename);
    let func = vm.name_str(code.name);
    let line = code.chunk.line_of(offset);
    Some((filename, line, func))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SharedPrint;

    fn run(source: &str) -> Result<String, KarasuError> {
        let output = SharedPrint::new();
        let mut interp = Interpreter::with_writer(Box::new(output.handle()));
        interp.interpret_entry(source, "test.krs")?;
        Ok(output.output())
    }

    #[test]
    fn arithmetic_prints() {
        assert_eq!(run("print(1 + 2 * 3)").unwrap(), "7\n");
    }

    #[test]
    fn module_name_is_main_for_entry() {
        assert_eq!(run("print(__name__)").unwrap(), "__main__\n");
    }

    #[test]
    fn unhandled_exception_reports_traceback() {
        let err = run("raise ValueError('boom')").unwrap_err();
        assert_eq!(err.exc_type, "ValueError");
        assert_eq!(err.message, "boom");
        assert!(err.traceback.contains("Traceback (most recent call last):"));
        assert!(err.traceback.contains("ValueError: boom"));
    }

    #[test]
    fn syntax_error_reports_location() {
        let output = SharedPrint::new();
        let mut interp = Interpreter::with_writer(Box::new(output.handle()));
        let err = interp.interpret("x = $", "bad.krs").unwrap_err();
        assert_eq!(err.exc_type, "SyntaxError");
        assert!(err.traceback.contains("bad.krs"));
    }
}
