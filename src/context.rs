//! Execution context pool.
//!
//! Each thread owns at most one interpreter per node and call frame,
//! created on first use and kept in thread-local storage. A
//! [`ContextLease`] moves the context out of its slot for the duration of a
//! call and puts it back on drop, so a second acquisition in the same frame
//! finds the slot empty and is reported as an
//! [`Error::ExclusiveAccessViolation`].
//!
//! A frame is opened for every job a thread runs. A job run inline while
//! another job on the same thread waits for it gets the next frame, and
//! with it an interpreter of its own.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::FunctionRegistry;
use crate::script::{Interpreter, ScriptValue};

type Setup = Arc<dyn Fn(&mut Interpreter) + Send + Sync>;

type SlotKey = (Uuid, usize);

thread_local! {
    /// `None` marks a context that is currently leased out.
    static CONTEXTS: RefCell<HashMap<SlotKey, Option<ExecutionContext>>> =
        RefCell::new(HashMap::new());
    static FRAME: Cell<usize> = const { Cell::new(0) };
}

/// A job frame on the current thread; closed on drop.
pub(crate) struct Frame {
    _thread_bound: PhantomData<*const ()>,
}

/// Open a new job frame on the current thread.
pub(crate) fn enter_frame() -> Frame {
    FRAME.with(|frame| frame.set(frame.get() + 1));
    Frame {
        _thread_bound: PhantomData,
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let _ = FRAME.try_with(|frame| frame.set(frame.get().saturating_sub(1)));
    }
}

fn current_frame() -> usize {
    FRAME.with(Cell::get)
}

/// One thread's interpreter for one node.
pub struct ExecutionContext {
    interp: Interpreter,
    generation: u64,
    memoized: HashSet<String>,
}

impl ExecutionContext {
    fn new(interp: Interpreter, generation: u64) -> Self {
        Self {
            interp,
            generation,
            memoized: HashSet::new(),
        }
    }

    /// The interpreter.
    pub fn interpreter(&mut self) -> &mut Interpreter {
        &mut self.interp
    }

    /// Registry generation the memoized globals were loaded from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Install a function loaded from the registry as a global.
    pub fn memoize(&mut self, name: &str, function: ScriptValue) {
        self.interp.set_global(name, function);
        self.memoized.insert(name.to_string());
    }

    /// Whether `name` was loaded from the registry.
    pub fn is_memoized(&self, name: &str) -> bool {
        self.memoized.contains(name)
    }

    /// Forget registry-loaded globals if the registry moved past them.
    pub fn sync_generation(&mut self, current: u64) {
        if self.generation == current {
            return;
        }
        for name in self.memoized.drain() {
            self.interp.remove_global(&name);
        }
        self.generation = current;
    }
}

/// Hands out per-thread execution contexts for one node.
#[derive(Clone)]
pub struct ContextPool {
    node: Uuid,
    label: String,
    registry: Arc<FunctionRegistry>,
    max_call_depth: usize,
    setup: Option<Setup>,
}

impl ContextPool {
    /// Pool for a node identified by `node`; `label` names it in diagnostics.
    pub fn new(
        node: Uuid,
        label: impl Into<String>,
        registry: Arc<FunctionRegistry>,
        max_call_depth: usize,
    ) -> Self {
        Self {
            node,
            label: label.into(),
            registry,
            max_call_depth,
            setup: None,
        }
    }

    /// Run `setup` on every freshly created interpreter.
    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: Fn(&mut Interpreter) + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(setup));
        self
    }

    /// Lease this thread's context, failing if it is already leased.
    pub fn try_acquire(&self) -> Result<ContextLease> {
        let generation = self.registry.generation();
        let key = (self.node, current_frame());
        let taken = CONTEXTS.with(|slots| match slots.borrow_mut().get_mut(&key) {
            Some(slot) => slot.take().map(Some).ok_or(()),
            None => Ok(None),
        });

        let mut context = match taken {
            Ok(Some(context)) => context,
            Ok(None) => {
                tracing::debug!(node = %self.label, frame = key.1, "creating execution context");
                // No slot until creation succeeded.
                let context = self.create(generation);
                CONTEXTS.with(|slots| slots.borrow_mut().insert(key, None));
                context
            }
            Err(()) => return Err(Error::ExclusiveAccessViolation(self.label.clone())),
        };
        context.sync_generation(generation);

        Ok(ContextLease {
            key,
            context: Some(context),
        })
    }

    /// Lease this thread's context. A second acquisition on the same thread
    /// is a fatal programming error and aborts the process.
    pub fn acquire(&self) -> ContextLease {
        match self.try_acquire() {
            Ok(lease) => lease,
            Err(err) => {
                tracing::error!(error = %err, "fatal: execution context acquired twice");
                std::process::abort();
            }
        }
    }

    fn create(&self, generation: u64) -> ExecutionContext {
        let mut interp = Interpreter::with_call_depth(self.max_call_depth);
        if let Some(setup) = &self.setup {
            setup(&mut interp);
        }
        ExecutionContext::new(interp, generation)
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("node", &self.label)
            .field("max_call_depth", &self.max_call_depth)
            .finish()
    }
}

/// Exclusive use of one thread's execution context.
///
/// Not `Send`: the context never leaves the thread that owns it.
pub struct ContextLease {
    key: SlotKey,
    context: Option<ExecutionContext>,
}

impl Deref for ContextLease {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        // Only emptied in drop.
        self.context.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for ContextLease {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.context.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        // During thread teardown the slot map may already be gone; the
        // context is simply dropped then.
        let _ = CONTEXTS.try_with(|slots| {
            if let Ok(mut slots) = slots.try_borrow_mut() {
                slots.insert(self.key, Some(context));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Bytecode;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn pool() -> ContextPool {
        ContextPool::new(Uuid::new_v4(), "test", Arc::new(FunctionRegistry::new()), 64)
    }

    #[test]
    fn context_is_reused_per_thread() {
        let pool = pool();
        {
            let mut lease = pool.try_acquire().unwrap();
            lease.interpreter().eval_source("(define counter 1)").unwrap();
        }
        let mut lease = pool.try_acquire().unwrap();
        assert!(lease.interpreter().global("counter").is_some());
    }

    #[test]
    fn second_acquire_is_a_violation() {
        let pool = pool();
        let _lease = pool.try_acquire().unwrap();
        assert!(matches!(
            pool.try_acquire(),
            Err(Error::ExclusiveAccessViolation(_))
        ));

        // Another node's context on the same thread is independent.
        let other = self::pool();
        assert!(other.try_acquire().is_ok());
    }

    #[test]
    fn threads_get_their_own_context() {
        let pool = pool();
        let _lease = pool.try_acquire().unwrap();
        let remote = pool.clone();
        std::thread::spawn(move || {
            let mut lease = remote.try_acquire().unwrap();
            assert!(lease.interpreter().global("counter").is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn lease_is_released_on_unwind() {
        let pool = pool();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _lease = pool.try_acquire().unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn nested_frames_get_their_own_context() {
        let pool = pool();
        let mut outer = pool.try_acquire().unwrap();
        outer.interpreter().eval_source("(define depth 0)").unwrap();
        {
            let _frame = enter_frame();
            let mut inner = pool.try_acquire().unwrap();
            assert!(inner.interpreter().global("depth").is_none());
            assert!(pool.try_acquire().is_err());
        }
        assert!(pool.try_acquire().is_err());
        drop(outer);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn failed_setup_does_not_poison_the_thread() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let pool = {
            let fail = fail.clone();
            pool().with_setup(move |_| {
                if fail.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    panic!("setup failed");
                }
            })
        };
        let result = catch_unwind(AssertUnwindSafe(|| pool.try_acquire().map(drop)));
        assert!(result.is_err());
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn setup_runs_once_per_context() {
        let pool = pool().with_setup(|interp| {
            interp.set_global("seeded", ScriptValue::Number(1.0));
        });
        let mut lease = pool.try_acquire().unwrap();
        assert_eq!(lease.interpreter().global("seeded").unwrap().as_number(), Some(1.0));
    }

    #[test]
    fn registry_changes_forget_memoized_globals() {
        let registry = Arc::new(FunctionRegistry::new());
        let pool = ContextPool::new(Uuid::new_v4(), "test", registry.clone(), 64);
        {
            let mut lease = pool.try_acquire().unwrap();
            lease.interpreter().eval_source("(defn own () 1)").unwrap();
            let function = lease.interpreter().eval_source("(fn () 2)").unwrap().remove(0);
            lease.memoize("loaded", function);
            assert!(lease.is_memoized("loaded"));
        }

        registry.insert("other", Bytecode::from_raw("\u{1b}XSC{}"));

        let mut lease = pool.try_acquire().unwrap();
        assert_eq!(lease.generation(), registry.generation());
        assert!(!lease.is_memoized("loaded"));
        assert!(lease.interpreter().global("loaded").is_none());
        // Script-defined globals survive.
        assert!(lease.interpreter().global("own").is_some());
    }
}
