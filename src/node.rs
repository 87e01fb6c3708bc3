//! Nodes and in-process clusters.
//!
//! A [`Node`] owns a worker pool (a tokio runtime whose blocking pool runs
//! target bodies), a function registry, an execution context pool and a
//! handle to the transport that reaches its peers. A [`Cluster`] wires
//! several nodes together over a [`LocalTransport`].

use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::bindings;
use crate::codec;
use crate::config::NodeConfig;
use crate::context::{self, ContextPool};
use crate::dataflow::{self, Target};
use crate::error::{Error, Result};
use crate::future::{FutureHandle, Outcome, Promise, Task, promise};
use crate::guard::{Guard, GuardSet};
use crate::registry::{FunctionRegistry, FunctionTable};
use crate::script::Interpreter;
use crate::transport::{LocalTransport, Locality, Request, Transport};
use crate::value::{ArgList, Value};

/// State shared by a node's workers, its bindings and the transport.
pub(crate) struct NodeShared {
    locality: Locality,
    config: NodeConfig,
    registry: Arc<FunctionRegistry>,
    transport: Arc<dyn Transport>,
    contexts: ContextPool,
    runtime: tokio::runtime::Handle,
}

impl NodeShared {
    pub(crate) fn locality(&self) -> Locality {
        self.locality
    }

    pub(crate) fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn all(&self) -> Vec<Locality> {
        self.transport.localities()
    }

    pub(crate) fn root(&self) -> Locality {
        self.transport.root().unwrap_or(self.locality)
    }

    pub(crate) fn remote(&self) -> Vec<Locality> {
        self.all()
            .into_iter()
            .filter(|locality| *locality != self.locality)
            .collect()
    }

    /// Run `job` on the worker pool and fulfill `promise` with its outcome.
    ///
    /// A reader blocked on the promise's handle may claim the job and run it
    /// inline before a worker picks it up. If the job panics or the pool is
    /// gone the promise is dropped and its handle reports a broken promise.
    fn spawn_job<F>(self: &Arc<Self>, promise: Promise, job: F)
    where
        F: FnOnce(&NodeShared) -> Outcome + Send + 'static,
    {
        let node = self.clone();
        let handle = promise.handle();
        let task = Task::new(move || {
            let _frame = context::enter_frame();
            promise.fulfill(job(&node));
        });
        if let Some(handle) = handle {
            handle.attach_task(&task);
        }
        self.runtime.spawn_blocking(move || task.run());
    }

    /// Invoke `target` on this thread's context.
    fn run_call(&self, target: &Target, args: ArgList, resolve_outputs: bool) -> Outcome {
        let values = {
            let mut context = self.contexts.acquire();
            dataflow::invoke(&mut context, &self.registry, target, args)?
        };
        if resolve_outputs {
            dataflow::resolve_outputs(values, self.config.max_unwrap_depth)
        } else {
            Ok(values)
        }
    }

    pub(crate) fn async_call(self: &Arc<Self>, target: Target, args: ArgList) -> FutureHandle {
        tracing::debug!(node = %self.locality, function = %target, "async call");
        let (promise, handle) = promise();
        self.spawn_job(promise, move |node| node.run_call(&target, args, false));
        handle
    }

    pub(crate) fn dataflow(self: &Arc<Self>, target: Target, args: ArgList) -> FutureHandle {
        tracing::debug!(node = %self.locality, function = %target, "dataflow call");
        let (promise, handle) = promise();
        handle.depends_on(args.iter().filter_map(Value::as_future).cloned());
        let node = self.clone();
        dataflow::resolve_inputs(args, move |resolved| match resolved {
            Ok(args) => node.spawn_job(promise, move |node| node.run_call(&target, args, true)),
            Err(err) => promise.set_fault(err),
        });
        handle
    }

    pub(crate) fn async_at(
        self: &Arc<Self>,
        locality: Locality,
        target: Target,
        args: ArgList,
    ) -> FutureHandle {
        if locality == self.locality {
            self.async_call(target, args)
        } else {
            self.transport.call(locality, Request::Async { target, args })
        }
    }

    pub(crate) fn dataflow_at(
        self: &Arc<Self>,
        locality: Locality,
        target: Target,
        args: ArgList,
    ) -> FutureHandle {
        if locality == self.locality {
            self.dataflow(target, args)
        } else {
            self.transport.call(locality, Request::Dataflow { target, args })
        }
    }

    pub(crate) fn then(
        self: &Arc<Self>,
        handle: &FutureHandle,
        target: Target,
        extra: ArgList,
    ) -> FutureHandle {
        let (promise, next) = promise();
        next.depends_on([handle.clone()]);
        let node = self.clone();
        handle.on_ready(move |outcome| match outcome {
            Ok(values) => {
                let mut args = extra;
                args.extend(values.iter().cloned());
                node.spawn_job(promise, move |node| node.run_call(&target, args, false));
            }
            Err(err) => promise.set_fault(err.clone()),
        });
        next
    }

    pub(crate) fn run_guarded(self: &Arc<Self>, target: Target, guards: &[Guard]) -> FutureHandle {
        let set = if guards.is_empty() {
            GuardSet::new(&[Guard::default_guard()])
        } else {
            GuardSet::new(guards)
        };
        let (promise, handle) = promise();
        let node = self.clone();
        // Queued on the guards until the whole set is free; only then does
        // the job take a worker.
        set.when_acquired(move |held| {
            node.spawn_job(promise, move |node| {
                let outputs = {
                    let mut context = node.contexts.acquire();
                    dataflow::invoke(&mut context, &node.registry, &target, held.carried_state())?
                };
                held.redistribute(outputs);
                Ok(Vec::new())
            });
        });
        handle
    }

    pub(crate) fn apply_registry(self: &Arc<Self>, table: Arc<FunctionTable>) -> FutureHandle {
        let (promise, handle) = promise();
        self.spawn_job(promise, move |node| node.apply_table(table));
        handle
    }

    /// Replace the registry with `table` and load every entry into this
    /// thread's context.
    fn apply_table(&self, table: Arc<FunctionTable>) -> Outcome {
        let generation = self.registry.replace(table.clone());
        let mut context = self.contexts.acquire();
        context.sync_generation(generation);
        for (name, code) in table.iter() {
            let function = context
                .interpreter()
                .load(code, Some(name))
                .map_err(|err| {
                    tracing::error!(
                        node = %self.locality,
                        function = %name,
                        size = code.len(),
                        error = %err,
                        "failed to load replicated function"
                    );
                    Error::CompileError {
                        name: name.clone(),
                        size: code.len(),
                        reason: err.to_string(),
                    }
                })?;
            context.memoize(name, function);
        }
        tracing::debug!(node = %self.locality, entries = table.len(), generation, "registry applied");
        Ok(Vec::new())
    }

    /// Send the whole registry to every remote node and wait for all of them.
    ///
    /// Nodes that already applied the table keep it when another fails.
    pub(crate) fn broadcast_registry(&self) -> Result<()> {
        let table = self.registry.snapshot();
        let pending: Vec<(Locality, FutureHandle)> = self
            .remote()
            .into_iter()
            .map(|to| (to, self.transport.call(to, Request::ApplyRegistry(table.clone()))))
            .collect();

        tracing::debug!(
            node = %self.locality,
            peers = pending.len(),
            entries = table.len(),
            "broadcasting registry"
        );

        let mut fault = None;
        for (locality, handle) in pending {
            if let Err(err) = handle.get() {
                tracing::error!(node = %self.locality, peer = %locality, error = %err, "registry broadcast failed");
                fault.get_or_insert(Error::RemoteFault {
                    locality,
                    message: err.to_string(),
                });
            }
        }
        fault.map_or(Ok(()), Err)
    }

    /// Publish the global functions `names` of `interp` to every node.
    pub(crate) fn register_from(&self, interp: &Interpreter, names: &[String]) -> Result<()> {
        let mut dumped = Vec::with_capacity(names.len());
        for name in names {
            let code = interp.dump_global(name).map_err(|err| {
                tracing::warn!(function = %name, error = %err, "cannot register");
                Error::FunctionNotFound(name.clone())
            })?;
            dumped.push((name.clone(), code));
        }
        for (name, code) in dumped {
            tracing::debug!(function = %name, size = code.len(), "registering function");
            self.registry.insert(name, code);
        }
        self.broadcast_registry()
    }

    /// Entry point for requests arriving through the transport.
    pub(crate) fn handle_request(self: &Arc<Self>, request: Request) -> FutureHandle {
        match request {
            Request::Async { target, args } => self.async_call(target, args),
            Request::Dataflow { target, args } => self.dataflow(target, args),
            Request::ApplyRegistry(table) => self.apply_registry(table),
        }
    }
}

/// One node: worker pool, registry, execution contexts and transport.
pub struct Node {
    shared: Arc<NodeShared>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Node {
    /// Start a standalone node at locality 0.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let transport = Arc::new(LocalTransport::new());
        Self::attach_local(&transport, config, Arc::new(FunctionRegistry::new()))
    }

    /// Start a node on the next free locality of `transport`.
    pub fn attach_local(
        transport: &Arc<LocalTransport>,
        config: NodeConfig,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        let locality = transport.next_locality();
        let node = Self::start(locality, config, registry, transport.clone())?;
        transport.attach(locality, Arc::downgrade(&node.shared));
        Ok(node)
    }

    /// Start a node at `locality` that reaches its peers through `transport`.
    pub fn start(
        locality: Locality,
        config: NodeConfig,
        registry: Arc<FunctionRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name(format!("{}-{}", config.thread_name, locality.id()))
            .enable_all()
            .build()
            .map_err(|e| Error::Executor(e.to_string()))?;

        let shared = Arc::new_cyclic(|weak: &Weak<NodeShared>| {
            let weak = weak.clone();
            let contexts = ContextPool::new(
                Uuid::new_v4(),
                locality.to_string(),
                registry.clone(),
                config.max_call_depth,
            )
            .with_setup(move |interp| bindings::install(interp, weak.clone()));
            NodeShared {
                locality,
                config,
                registry,
                transport,
                contexts,
                runtime: runtime.handle().clone(),
            }
        });

        tracing::info!(node = %locality, "node started");
        Ok(Self {
            shared,
            runtime: Some(runtime),
        })
    }

    /// This node's locality.
    pub fn here(&self) -> Locality {
        self.shared.locality()
    }

    /// The lowest live locality.
    pub fn root(&self) -> Locality {
        self.shared.root()
    }

    /// Every live locality.
    pub fn all(&self) -> Vec<Locality> {
        self.shared.all()
    }

    /// Every live locality except this one.
    pub fn remote(&self) -> Vec<Locality> {
        self.shared.remote()
    }

    /// The node's function registry.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.shared.registry
    }

    /// The node's configuration.
    pub fn config(&self) -> &NodeConfig {
        self.shared.config()
    }

    /// Evaluate `source` on the calling thread's context.
    pub fn eval(&self, source: &str) -> Result<ArgList> {
        let mut context = self.shared.contexts.try_acquire()?;
        let outputs = context.interpreter().eval_source(source)?;
        codec::pack_all(&outputs)
    }

    /// Run `target` on a worker without resolving `args`.
    pub fn async_call(&self, target: impl Into<Target>, args: ArgList) -> FutureHandle {
        self.shared.async_call(target.into(), args)
    }

    /// [`Node::async_call`] on another node.
    pub fn async_at(
        &self,
        locality: Locality,
        target: impl Into<Target>,
        args: ArgList,
    ) -> FutureHandle {
        self.shared.async_at(locality, target.into(), args)
    }

    /// Run `target` once every future in `args` is resolved, and resolve
    /// the futures it returns before fulfilling.
    pub fn dataflow(&self, target: impl Into<Target>, args: ArgList) -> FutureHandle {
        self.shared.dataflow(target.into(), args)
    }

    /// [`Node::dataflow`] on another node.
    pub fn dataflow_at(
        &self,
        locality: Locality,
        target: impl Into<Target>,
        args: ArgList,
    ) -> FutureHandle {
        self.shared.dataflow_at(locality, target.into(), args)
    }

    /// Run `target` with `extra` followed by the values of `handle` once it
    /// is fulfilled. A fault of `handle` skips `target`.
    pub fn then(
        &self,
        handle: &FutureHandle,
        target: impl Into<Target>,
        extra: ArgList,
    ) -> FutureHandle {
        self.shared.then(handle, target.into(), extra)
    }

    /// Run `target` over the carried state of `guards` while holding all
    /// of them; an empty slice uses the default guard.
    pub fn run_guarded(&self, target: impl Into<Target>, guards: &[Guard]) -> FutureHandle {
        self.shared.run_guarded(target.into(), guards)
    }

    /// Publish global functions of the calling thread's context.
    pub fn register(&self, names: &[&str]) -> Result<()> {
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        let mut context = self.shared.contexts.try_acquire()?;
        self.shared.register_from(context.interpreter(), &names)
    }

    /// Replace the registry with `table` and load it on a worker.
    pub fn apply_registry(&self, table: Arc<FunctionTable>) -> FutureHandle {
        self.shared.apply_registry(table)
    }

    /// Send the whole registry to every remote node.
    pub fn broadcast_registry(&self) -> Result<()> {
        self.shared.broadcast_registry()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        tracing::debug!(node = %self.shared.locality, "node stopped");
    }
}

/// Several nodes in one process.
pub struct Cluster {
    transport: Arc<LocalTransport>,
    nodes: Vec<Node>,
}

impl Cluster {
    /// Start `size` nodes at localities `0..size`, each with its own registry.
    pub fn new(size: usize, config: NodeConfig) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("a cluster needs at least one node".into()));
        }
        let transport = Arc::new(LocalTransport::new());
        let nodes = (0..size)
            .map(|_| {
                Node::attach_local(&transport, config.clone(), Arc::new(FunctionRegistry::new()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { transport, nodes })
    }

    /// Node at locality 0.
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// Node at `locality`.
    pub fn node(&self, locality: Locality) -> Option<&Node> {
        self.nodes.iter().find(|node| node.here() == locality)
    }

    /// All nodes, by locality.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; clusters have at least one node.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The transport connecting the nodes.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }
}
