//! xscript – futures, dataflow and replicated functions for an embedded
//! script interpreter
//!
//! Scripts run in a single-threaded interpreter and hand work to a node's
//! worker pool or to other nodes:
//! - Portable values marshaled across threads and nodes
//! - Single-assignment futures with when-all / when-any / then / unwrap
//! - Dataflow calls that resolve pending inputs and outputs around a call
//! - Guards serializing jobs over carried state
//! - A function registry replicated to every node by broadcast

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Script builtins for the node operations
mod bindings;
/// Marshaling between interpreter values and portable values
pub mod codec;
/// Future combinators
pub mod combinators;
/// Node configuration
pub mod config;
/// Per-thread execution contexts
pub mod context;
/// Invocation and future resolution around calls
pub mod dataflow;
/// Error types
pub mod error;
/// Single-assignment futures
pub mod future;
/// Guards and guarded execution
pub mod guard;
/// Nodes and clusters
pub mod node;
/// Replicated function registry
pub mod registry;
/// Embedded script interpreter
pub mod script;
/// Node addressing and request delivery
pub mod transport;
/// Portable values
pub mod value;

// Re-export key types for convenience
pub use config::NodeConfig;
pub use dataflow::Target;
pub use error::{Error, Result};
pub use future::{FutureHandle, Promise, promise};
pub use guard::Guard;
pub use node::{Cluster, Node};
pub use registry::{FunctionRegistry, FunctionTable};
pub use transport::{LocalTransport, Locality, Request, Transport};
pub use value::{ArgList, Key, Value};

/// Current version of xscript
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
