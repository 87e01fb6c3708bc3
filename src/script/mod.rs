//! Embedded script interpreter.
//!
//! A small s-expression language that plays the role of the embedded,
//! single-threaded interpreter: it offers globals, call/return with multiple
//! values, host-registered native functions, and a deterministic function
//! dump/load format ("bytecode") so functions can travel between threads and
//! nodes. Interpreter state is `!Send` and lives in one thread's execution
//! context (see [`crate::context`]).

/// Abstract syntax tree definitions.
pub mod ast;
/// Core library functions available in every interpreter.
pub mod builtins;
/// Function dump/load.
pub mod chunk;
/// Evaluator.
pub mod eval;
/// Parser for the s-expression syntax.
pub mod parser;
/// Interpreter-native values.
pub mod value;

pub use ast::{Expr, Program};
pub use chunk::{BYTECODE_SIGNATURE, Bytecode, dump, is_bytecode, load};
pub use eval::{DEFAULT_MAX_CALL_DEPTH, Interpreter};
pub use parser::parse_program;
pub use value::{Function, NativeFunction, ScriptValue, Table, TableRef};

use thiserror::Error;

/// Convenience result alias for interpreter operations.
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Errors surfaced by the parser/interpreter.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    /// Parsing failed due to invalid syntax.
    #[error("invalid syntax: {0}")]
    Syntax(String),

    /// Evaluation failed (bad operand, `error` builtin, malformed form).
    #[error("{0}")]
    Runtime(String),

    /// Attempted to call a value that is not a function.
    #[error("attempt to call a {0} value")]
    NotCallable(String),

    /// Call depth exceeded the configured bound.
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),

    /// Bytecode could not be produced or loaded.
    #[error("bad bytecode: {0}")]
    Bytecode(String),

    /// A host (runtime) operation failed inside a native function.
    #[error(transparent)]
    Host(#[from] crate::Error),
}

impl From<ScriptError> for crate::Error {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Host(inner) => inner,
            other => crate::Error::Script(other.to_string()),
        }
    }
}

pub(crate) fn runtime_error(message: impl Into<String>) -> ScriptError {
    ScriptError::Runtime(message.into())
}
