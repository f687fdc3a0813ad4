//! The uniform stack cell of the virtual machine.
//!
//! A [`Value`] is either an immediate primitive (int, float, bool, `None`,
//! `NotImplemented`), a reference to a heap object, or one of the non-value
//! *markers* the VM threads through the stack: exception/cleanup handler
//! records and keyword-argument counts. Markers are first-class enum variants
//! rather than bit patterns overloaded onto integers, so a stray marker can
//! never be confused with user data.

use serde::{Deserialize, Serialize};

use crate::heap::HeapId;

/// A single slot on the value stack.
///
/// `Value` is `Copy`: heap references are plain arena indices and object
/// lifetimes are managed by the tracing collector, not by value drops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Unbound local slot / missing-default sentinel. Never visible to user code.
    Undefined,
    None,
    /// The `NotImplemented` singleton returned by reflected-operator protocols.
    NotImplemented,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exception/cleanup handler record living on the value stack.
    Handler(Handler),
    /// Keyword-argument marker; the payload is only meaningful to the call opcode.
    Kwargs(u32),
    /// Reference to a heap object.
    Ref(HeapId),
}

/// Kind of a stack handler record.
///
/// `Try`, `With` and `Finally` are pushed by their opcodes; the remaining
/// kinds are written in place by the unwinder to record what the cleanup
/// block must do once it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Protects a `try` body; target is the first except clause.
    Try,
    /// An except clause is currently running for this handler.
    ExceptScope,
    /// Protects a `try`/`finally` body; target is the finally block.
    Finally,
    /// Protects a `with` body; target is the cleanup block. The bound
    /// `__exit__` sits in the slot directly below the handler.
    With,
    /// Cleanup entered on the normal path; nothing pending.
    Normal,
    /// Cleanup entered while unwinding; the exception sits above the marker
    /// and must be re-raised when the cleanup block completes.
    PendingRaise,
    /// Cleanup entered by `return`; the return value sits above the marker.
    PendingReturn,
    /// Cleanup entered by `break`/`continue`; jump to `target` afterwards,
    /// running `remaining` further cleanup regions on the way and popping
    /// `pops` leftover slots before the final jump.
    PendingJump { remaining: u8, pops: u8 },
}

/// A handler record: kind plus the absolute bytecode offset (within the
/// current frame's chunk) where handling resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub kind: HandlerKind,
    pub target: u32,
}

impl Value {
    #[inline]
    #[must_use]
    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    #[inline]
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    #[inline]
    #[must_use]
    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    #[inline]
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    #[must_use]
    pub fn is_notimpl(&self) -> bool {
        matches!(self, Self::NotImplemented)
    }

    #[inline]
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    #[inline]
    #[must_use]
    pub fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }

    #[inline]
    #[must_use]
    pub fn is_kwargs(&self) -> bool {
        matches!(self, Self::Kwargs(_))
    }

    #[inline]
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Extracts the integer payload.
    #[inline]
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extracts the float payload.
    #[inline]
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Extracts the heap reference payload.
    #[inline]
    #[must_use]
    pub fn as_ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Extracts the handler payload.
    #[inline]
    #[must_use]
    pub fn as_handler(&self) -> Option<Handler> {
        match self {
            Self::Handler(h) => Some(*h),
            _ => None,
        }
    }

    /// Numeric value as f64 for int/float/bool, used by mixed-mode arithmetic.
    #[inline]
    #[must_use]
    pub fn coerce_float(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Integer value for int/bool operands, used by integer fast paths.
    #[inline]
    #[must_use]
    pub fn coerce_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_variants() {
        assert!(Value::Int(1).is_int());
        assert!(Value::Float(1.5).is_float());
        assert!(Value::None.is_none());
        assert!(Value::NotImplemented.is_notimpl());
        assert!(Value::Kwargs(3).is_kwargs());
        assert!(!Value::Int(0).is_object());
        let h = Value::Handler(Handler {
            kind: HandlerKind::Try,
            target: 12,
        });
        assert!(h.is_handler());
        assert_eq!(h.as_handler().unwrap().target, 12);
    }

    #[test]
    fn coercions() {
        assert_eq!(Value::Bool(true).coerce_int(), Some(1));
        assert_eq!(Value::Int(3).coerce_float(), Some(3.0));
        assert_eq!(Value::None.coerce_int(), None);
    }
}
