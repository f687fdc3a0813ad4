//! Exception taxonomy and error plumbing.
//!
//! At runtime an exception is an instance of one of the builtin exception
//! classes. Inside the VM, fallible operations return [`VmResult`]; an error
//! is either a not-yet-instantiated `(type, message)` pair or an exception
//! value that is already flowing through the unwinder. The embedding surface
//! sees a [`KarasuError`] with the rendered traceback.

use strum::{Display, EnumIter, IntoStaticStr};

use crate::value::Value;

/// The builtin exception hierarchy.
///
/// `KeyboardInterrupt` sits directly under the root, not under `Exception`,
/// so a bare `except Exception` does not swallow interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
pub enum ExcType {
    BaseException,
    Exception,
    TypeError,
    ArgumentError,
    IndexError,
    KeyError,
    AttributeError,
    NameError,
    ImportError,
    OSError,
    ValueError,
    ZeroDivisionError,
    NotImplementedError,
    AssertionError,
    SyntaxError,
    SystemError,
    RuntimeError,
    KeyboardInterrupt,
}

impl ExcType {
    /// Parent class in the hierarchy; `None` only for the root.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception | Self::KeyboardInterrupt => Some(Self::BaseException),
            Self::ArgumentError => Some(Self::TypeError),
            _ => Some(Self::Exception),
        }
    }

    /// True if `self` is `other` or a subclass of it.
    #[must_use]
    pub fn is_subtype(self, other: Self) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t == other {
                return true;
            }
            current = t.parent();
        }
        false
    }
}

/// An error propagating out of a VM operation.
#[derive(Debug)]
pub enum VmErr {
    /// Exception described by type and message; the unwinder instantiates it.
    Pending(ExcType, String),
    /// An exception instance already built (re-raise, user `raise`).
    Raised(Value),
}

pub type VmResult<T> = Result<T, VmErr>;

impl VmErr {
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::TypeError, message.into())
    }

    #[must_use]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::ValueError, message.into())
    }

    #[must_use]
    pub fn index_error(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::IndexError, message.into())
    }

    #[must_use]
    pub fn key_error(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::KeyError, message.into())
    }

    #[must_use]
    pub fn name_error(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::NameError, message.into())
    }

    #[must_use]
    pub fn attribute_error(type_name: &str, attr: &str) -> Self {
        Self::Pending(
            ExcType::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    #[must_use]
    pub fn import_error(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::ImportError, message.into())
    }

    #[must_use]
    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::ZeroDivisionError, message.into())
    }

    #[must_use]
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::RuntimeError, message.into())
    }

    #[must_use]
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::Pending(ExcType::NotImplementedError, message.into())
    }

    /// Unsupported-operand diagnostic shared by the arithmetic dispatcher.
    #[must_use]
    pub fn unsupported_operands(op: &str, lhs: &str, rhs: &str) -> Self {
        Self::type_error(format!(
            "unsupported operand type(s) for {op}: '{lhs}' and '{rhs}'"
        ))
    }
}

/// A compile-time failure with full source context.
///
/// Rendered the way the runtime renders a `SyntaxError`: location header,
/// the offending line, and a caret run under the error span.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub width: u32,
    pub func: Option<String>,
    pub line_text: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  File {}, line {}", self.file, self.line)?;
        if let Some(func) = &self.func {
            writeln!(f, "  in {func}")?;
        }
        if !self.line_text.is_empty() {
            writeln!(f, "    {}", self.line_text)?;
            let pad = " ".repeat(self.column as usize);
            let carets = "^".repeat((self.width.max(1)) as usize);
            writeln!(f, "    {pad}{carets}")?;
        }
        write!(f, "SyntaxError: {}", self.message)
    }
}

/// An error surfaced to the embedding application: the exception type name,
/// message, and the rendered traceback (or syntax-error report).
#[derive(Debug, Clone)]
pub struct KarasuError {
    pub exc_type: String,
    pub message: String,
    pub traceback: String,
}

impl KarasuError {
    #[must_use]
    pub fn from_compile_error(err: &CompileError) -> Self {
        Self {
            exc_type: ExcType::SyntaxError.to_string(),
            message: err.message.clone(),
            traceback: err.to_string(),
        }
    }
}

impl std::fmt::Display for KarasuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.traceback)
    }
}

impl std::error::Error for KarasuError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_subtyping() {
        assert!(ExcType::ArgumentError.is_subtype(ExcType::TypeError));
        assert!(ExcType::ArgumentError.is_subtype(ExcType::Exception));
        assert!(ExcType::KeyboardInterrupt.is_subtype(ExcType::BaseException));
        assert!(!ExcType::KeyboardInterrupt.is_subtype(ExcType::Exception));
        assert!(!ExcType::ValueError.is_subtype(ExcType::TypeError));
    }

    #[test]
    fn compile_error_renders_caret() {
        let err = CompileError {
            message: "unexpected token".to_owned(),
            file: "test.krs".to_owned(),
            line: 3,
            column: 4,
            width: 2,
            func: None,
            line_text: "x = $$".to_owned(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("line 3"));
        assert!(rendered.contains("^^"));
        assert!(rendered.contains("SyntaxError: unexpected token"));
    }
}
