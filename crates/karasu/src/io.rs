//! Output abstraction for `print`, tracebacks, and VM trace output.

/// Destination for interpreter output.
///
/// `print` and the unhandled-exception traceback write through this trait so
/// hosts and tests can capture output instead of touching process stdout.
pub trait PrintWriter {
    fn write_str(&mut self, s: &str);

    fn write_line(&mut self, s: &str) {
        self.write_str(s);
        self.write_str("\n");
    }
}

/// Writes to the process stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_str(&mut self, s: &str) {
        print!("{s}");
    }
}

/// Collects output into a string, used by tests and the embedding API.
#[derive(Debug, Default, Clone)]
pub struct CollectStringPrint {
    output: String,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.output
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_str(&mut self, s: &str) {
        self.output.push_str(s);
    }
}

/// Discards all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_str(&mut self, _s: &str) {}
}

/// Shared buffer writer: the VM owns one end, the caller keeps a handle to
/// read the captured output afterwards.
#[derive(Debug, Default, Clone)]
pub struct SharedPrint {
    buffer: std::rc::Rc<std::cell::RefCell<String>>,
}

impl SharedPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle over the same buffer.
    #[must_use]
    pub fn handle(&self) -> Self {
        Self {
            buffer: std::rc::Rc::clone(&self.buffer),
        }
    }

    #[must_use]
    pub fn output(&self) -> String {
        self.buffer.borrow().clone()
    }
}

impl PrintWriter for SharedPrint {
    fn write_str(&mut self, s: &str) {
        self.buffer.borrow_mut().push_str(s);
    }
}
