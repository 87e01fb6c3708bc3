//! Error types for the xscript runtime
//!
//! Every variant is cloneable so that a fault can be recorded inside a
//! future and observed by any number of readers.

use thiserror::Error;

use crate::transport::Locality;

/// Top-level runtime error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A value has no portable representation (native function, guard,
    /// locality, cyclic table).
    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    /// Neither the execution context nor the registry knows the function.
    #[error("function '{0}' is not defined")]
    FunctionNotFound(String),

    /// Stored bytecode failed to load
    #[error("failed to load function '{name}' (size={size}): {reason}")]
    CompileError {
        /// Function name, or `<anonymous>` for inline code
        name: String,
        /// Size of the offending bytecode blob in bytes
        size: usize,
        /// Loader diagnostic
        reason: String,
    },

    /// A broadcast participant failed to apply the registry
    #[error("remote fault on {locality}: {message}")]
    RemoteFault {
        /// Node that reported the failure
        locality: Locality,
        /// Description of the failure
        message: String,
    },

    /// The calling thread already holds the node's execution context
    #[error("execution context for node {0} is already held by this thread")]
    ExclusiveAccessViolation(String),

    /// A future-of-future chain exceeded the configured unwrap depth
    #[error("future chain exceeds the maximum unwrap depth of {0}")]
    UnwrapDepthExceeded(usize),

    /// A script raised an error
    #[error("script error: {0}")]
    Script(String),

    /// The producer of a future went away without fulfilling it
    #[error("promise dropped before it was fulfilled")]
    BrokenPromise,

    /// The transport has no live node for the locality
    #[error("{0} is unavailable")]
    NodeUnavailable(Locality),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// The worker pool could not be started
    #[error("executor error: {0}")]
    Executor(String),
}

/// Result type using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
