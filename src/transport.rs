//! Node addressing and request delivery.
//!
//! A [`Transport`] knows the set of live localities and delivers a
//! [`Request`] to one of them, returning that node's future handle. The
//! crate ships [`LocalTransport`], which routes requests between nodes
//! hosted in the same process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::dataflow::Target;
use crate::error::Error;
use crate::future::FutureHandle;
use crate::node::NodeShared;
use crate::registry::FunctionTable;
use crate::value::ArgList;

/// Opaque node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Locality(pub u32);

impl Locality {
    /// Numeric id of the node.
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locality#{}", self.0)
    }
}

/// Work shipped to another node.
#[derive(Debug, Clone)]
pub enum Request {
    /// Invoke a target without resolving its arguments
    Async {
        /// Function to run
        target: Target,
        /// Arguments, futures left live
        args: ArgList,
    },
    /// Invoke a target after resolving every future argument
    Dataflow {
        /// Function to run
        target: Target,
        /// Arguments, futures resolved on the receiving node
        args: ArgList,
    },
    /// Replace the receiving node's registry and load every entry
    ApplyRegistry(Arc<FunctionTable>),
}

impl Request {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Async { .. } => "async",
            Request::Dataflow { .. } => "dataflow",
            Request::ApplyRegistry(_) => "apply-registry",
        }
    }
}

/// Delivery of requests between nodes.
pub trait Transport: Send + Sync {
    /// Every live locality, in ascending order.
    fn localities(&self) -> Vec<Locality>;

    /// Deliver `request` to `to` and return the handle for its outcome.
    fn call(&self, to: Locality, request: Request) -> FutureHandle;

    /// The lowest locality.
    fn root(&self) -> Option<Locality> {
        self.localities().into_iter().min()
    }
}

/// In-process transport: requests are handed straight to the target node.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<BTreeMap<Locality, Weak<NodeShared>>>,
}

impl LocalTransport {
    /// Empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable at `locality`.
    pub(crate) fn attach(&self, locality: Locality, node: Weak<NodeShared>) {
        self.nodes.write().insert(locality, node);
    }

    /// Remove `locality` from the routing table.
    pub fn detach(&self, locality: Locality) {
        self.nodes.write().remove(&locality);
    }

    /// Next unused locality id.
    pub(crate) fn next_locality(&self) -> Locality {
        let nodes = self.nodes.read();
        Locality(nodes.keys().next_back().map_or(0, |last| last.0 + 1))
    }

    fn resolve(&self, locality: Locality) -> Option<Arc<NodeShared>> {
        self.nodes.read().get(&locality).and_then(Weak::upgrade)
    }
}

impl Transport for LocalTransport {
    fn localities(&self) -> Vec<Locality> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, node)| node.strong_count() > 0)
            .map(|(locality, _)| *locality)
            .collect()
    }

    fn call(&self, to: Locality, request: Request) -> FutureHandle {
        match self.resolve(to) {
            Some(node) => {
                tracing::debug!(to = %to, request = request.kind(), "delivering request");
                node.handle_request(request)
            }
            None => {
                tracing::warn!(to = %to, request = request.kind(), "no node at locality");
                FutureHandle::faulted(Error::NodeUnavailable(to))
            }
        }
    }
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("localities", &self.localities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locality_display() {
        assert_eq!(Locality(3).to_string(), "locality#3");
        assert!(Locality(0) < Locality(1));
    }

    #[test]
    fn missing_node_faults() {
        let transport = LocalTransport::new();
        assert!(transport.localities().is_empty());
        assert_eq!(transport.root(), None);
        assert_eq!(transport.next_locality(), Locality(0));

        let handle = transport.call(Locality(7), Request::ApplyRegistry(Arc::default()));
        assert_eq!(handle.get(), Err(Error::NodeUnavailable(Locality(7))));
    }
}
