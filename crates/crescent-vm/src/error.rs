//! Runtime error types.

use crescent_core::string::StringPool;
use crescent_core::value::Value;
use std::fmt;

/// A runtime error surfaced by the interpreter or the embedding API.
#[derive(Clone, Debug)]
pub enum LuaError {
    /// Value-stack or call-depth exhaustion.
    StackOverflow,
    /// Indexing a non-table value.
    ExpectedTable { got: &'static str },
    /// Calling a non-function value.
    AttemptToCallNonFunction { got: &'static str },
    /// Arithmetic on a non-numeric operand.
    AttemptToPerformArithmetic { got: &'static str },
    /// Concatenating a non-string, non-number operand.
    AttemptToConcatenate { got: &'static str },
    /// Length of a value that is neither string nor table.
    AttemptToGetLength { got: &'static str },
    /// Writing a table entry under a nil key.
    TableIndexIsNil,
    /// Allocation failure; always fatal.
    OutOfMemory,
    /// General runtime error with a message (comparison mismatches,
    /// library errors, error("message")).
    Runtime(String),
    /// error() raised with a non-string value.
    Value(Value),
    /// The chunk failed to compile.
    Compile(String),
}

impl LuaError {
    /// Convert this error into a value suitable for pcall results.
    pub fn to_value(&self, strings: &mut StringPool) -> Value {
        match self {
            LuaError::Value(v) => *v,
            other => {
                let msg = format!("{other}");
                Value::from_str_id(strings.intern(msg.as_bytes()))
            }
        }
    }

    /// True for errors no protected call may intercept.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LuaError::OutOfMemory)
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::ExpectedTable { got } => {
                write!(f, "attempt to index a {got} value")
            }
            LuaError::AttemptToCallNonFunction { got } => {
                write!(f, "attempt to call a {got} value")
            }
            LuaError::AttemptToPerformArithmetic { got } => {
                write!(f, "attempt to perform arithmetic on a {got} value")
            }
            LuaError::AttemptToConcatenate { got } => {
                write!(f, "attempt to concatenate a {got} value")
            }
            LuaError::AttemptToGetLength { got } => {
                write!(f, "attempt to get length of a {got} value")
            }
            LuaError::TableIndexIsNil => write!(f, "table index is nil"),
            LuaError::OutOfMemory => write!(f, "not enough memory"),
            LuaError::Runtime(msg) => write!(f, "{msg}"),
            LuaError::Value(v) => write!(f, "{v:?}"),
            LuaError::Compile(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for LuaError {}
