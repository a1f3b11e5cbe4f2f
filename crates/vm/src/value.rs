//! Value representation for the Brio VM.
//!
//! A `Value` is a small `Copy` tagged union: immediates (`nil`, booleans,
//! IEEE doubles) are stored inline, everything else is a typed handle into
//! the garbage-collected heap. Handles are plain indices, so cloning a
//! value never touches the heap.

use std::fmt;

use crate::gc::{GcClosure, GcFunction, GcNative, GcPtr, GcString, GcTuple, RawGcPtr};

/// A runtime value.
///
/// Equality is structural on the tag: numbers compare as IEEE doubles
/// (`NaN != NaN`), booleans and nil by tag, and heap values by handle
/// identity. Strings are interned, so handle identity coincides with
/// content equality. Tuples and callables deliberately compare by
/// identity, not by contents.
#[derive(Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    String(GcPtr<GcString>),
    Function(GcPtr<GcFunction>),
    Native(GcPtr<GcNative>),
    Closure(GcPtr<GcClosure>),
    Tuple(GcPtr<GcTuple>),
}

impl Value {
    /// Only `false` is falsey. `nil`, `0` and `""` are all truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            Value::Native(_) => "native function",
            Value::Closure(_) => "function",
            Value::Tuple(_) => "tuple",
        }
    }

    /// The heap slot this value references, if any. Used for GC rooting.
    pub fn as_gc_ptr(&self) -> Option<RawGcPtr> {
        match self {
            Value::Nil | Value::Bool(_) | Value::Number(_) => None,
            Value::String(ptr) => Some(ptr.as_raw()),
            Value::Function(ptr) => Some(ptr.as_raw()),
            Value::Native(ptr) => Some(ptr.as_raw()),
            Value::Closure(ptr) => Some(ptr.as_raw()),
            Value::Tuple(ptr) => Some(ptr.as_raw()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(ptr) => write!(f, "String({:?})", ptr),
            Value::Function(ptr) => write!(f, "Function({:?})", ptr),
            Value::Native(ptr) => write!(f, "Native({:?})", ptr),
            Value::Closure(ptr) => write!(f, "Closure({:?})", ptr),
            Value::Tuple(ptr) => write!(f, "Tuple({:?})", ptr),
        }
    }
}

/// Canonical textual form of a number.
///
/// Integral finite doubles render with no fractional part; other finite
/// doubles use the shortest round-trip form. The same routine backs
/// `PRINT`, the `print` native, and number-to-string coercion in `ADD`.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == n.trunc() {
        format!("{:.0}", n)
    } else {
        n.to_string()
    }
}

/// An error raised while executing bytecode.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Operands must be numbers.")]
    NumberOperands,

    #[error("Operand must be a number.")]
    NumberOperand,

    #[error("Operands must be two numbers or two strings.")]
    AddOperands,

    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),

    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Cannot call a non-callable value.")]
    NotCallable,

    #[error("Type error: expected {expected}, got {found}")]
    TypeError {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Stack overflow.")]
    StackOverflow,

    #[error("Invalid bytecode: {0}")]
    InvalidBytecode(&'static str),

    #[error("{error}\n{stack_trace}")]
    WithStackTrace {
        error: Box<RuntimeError>,
        stack_trace: String,
    },
}

impl RuntimeError {
    /// Wrap this error with a formatted frame trace.
    pub fn with_stack_trace(self, stack_trace: String) -> RuntimeError {
        RuntimeError::WithStackTrace {
            error: Box::new(self),
            stack_trace,
        }
    }
}
