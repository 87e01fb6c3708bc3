//! Single-assignment future handles.
//!
//! A [`FutureHandle`] is the read side of an eventual [`ArgList`]; the
//! matching [`Promise`] is the write side and is consumed when fulfilled, so
//! a handle can be assigned at most once. Readers may block ([`FutureHandle::get`]),
//! attach a continuation ([`FutureHandle::on_ready`]) or `.await` the handle.
//! Continuations run on the thread that fulfills the promise.
//!
//! A blocking reader does not just park. If the job that fulfills the handle
//! is still queued, the reader claims it and runs it inline, and it does the
//! same for the handles the awaited one depends on. A job blocked in `get`
//! therefore never waits on work that is stuck behind it in the queue.

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::value::ArgList;

/// Final state of a future: the produced values or a recorded fault.
pub type Outcome = Result<ArgList>;

type Callback = Box<dyn FnOnce(&Outcome) + Send>;
type Job = Box<dyn FnOnce() + Send>;

static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);

/// How long a reader with pending dependencies parks before looking for
/// claimable work again.
const HELP_INTERVAL: Duration = Duration::from_millis(2);

/// A dispatched job that runs exactly once, on whichever thread claims it
/// first: a pool worker, or a reader blocked on its result.
///
/// Handles only keep a weak reference, so a job dropped by its queue is
/// dropped for good and its promise breaks.
pub(crate) struct Task {
    job: Arc<Mutex<Option<Job>>>,
}

impl Task {
    pub(crate) fn new<F>(job: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            job: Arc::new(Mutex::new(Some(Box::new(job)))),
        }
    }

    /// Run the job unless another thread claimed it. Returns whether it ran.
    pub(crate) fn run(&self) -> bool {
        let Some(job) = self.job.lock().take() else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("job panicked");
        }
        true
    }
}

#[derive(Clone)]
struct TaskRef(Weak<Mutex<Option<Job>>>);

impl TaskRef {
    fn run(&self) -> bool {
        self.0.upgrade().is_some_and(|job| Task { job }.run())
    }
}

enum State {
    Pending {
        callbacks: Vec<Callback>,
        wakers: Vec<Waker>,
        task: Option<TaskRef>,
        depends_on: Vec<FutureHandle>,
        revision: u64,
    },
    Ready(Outcome),
}

struct Shared {
    id: u64,
    state: Mutex<State>,
    ready: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            id: NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::Pending {
                callbacks: Vec::new(),
                wakers: Vec::new(),
                task: None,
                depends_on: Vec::new(),
                revision: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut *state, State::Ready(outcome.clone()));
        drop(state);
        self.ready.notify_all();

        match previous {
            State::Pending { callbacks, wakers, .. } => {
                for waker in wakers {
                    waker.wake();
                }
                for callback in callbacks {
                    callback(&outcome);
                }
            }
            State::Ready(_) => unreachable!("future {} fulfilled twice", self.id),
        }
    }
}

/// Create a connected promise/handle pair.
pub fn promise() -> (Promise, FutureHandle) {
    let shared = Arc::new(Shared::new());
    (
        Promise {
            shared: Some(shared.clone()),
        },
        FutureHandle { shared },
    )
}

/// Shared read side of an eventual [`ArgList`].
#[derive(Clone)]
pub struct FutureHandle {
    shared: Arc<Shared>,
}

impl FutureHandle {
    /// A handle that is already fulfilled with `values`.
    pub fn ready(values: ArgList) -> Self {
        let (promise, handle) = promise();
        promise.set_value(values);
        handle
    }

    /// A handle that is already fulfilled with a fault.
    pub fn faulted(error: Error) -> Self {
        let (promise, handle) = promise();
        promise.set_fault(error);
        handle
    }

    /// Process-unique identifier, used in diagnostics.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the handle has been fulfilled.
    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Ready(_))
    }

    /// Return the outcome if the handle has been fulfilled.
    pub fn try_get(&self) -> Option<Outcome> {
        match &*self.shared.state.lock() {
            State::Ready(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Block the calling thread until the handle is fulfilled.
    pub fn wait(&self) {
        let _ = self.get();
    }

    /// Block until fulfilled and return the values or the recorded fault.
    ///
    /// Queued work this handle waits on is run inline on the calling thread.
    pub fn get(&self) -> Outcome {
        loop {
            let revision = match &*self.shared.state.lock() {
                State::Ready(outcome) => return outcome.clone(),
                State::Pending { revision, .. } => *revision,
            };
            if self.help() {
                continue;
            }

            let mut state = self.shared.state.lock();
            let (changed, has_dependencies) = match &*state {
                State::Ready(outcome) => return outcome.clone(),
                State::Pending {
                    revision: current,
                    depends_on,
                    ..
                } => (*current != revision, !depends_on.is_empty()),
            };
            if changed {
                continue;
            }
            if has_dependencies {
                // A dependency's own job may be dispatched later without
                // notifying this handle.
                self.shared.ready.wait_for(&mut state, HELP_INTERVAL);
            } else {
                self.shared.ready.wait(&mut state);
            }
        }
    }

    /// Run one piece of queued work this handle waits on, if any is still
    /// unclaimed. Returns whether something ran.
    fn help(&self) -> bool {
        let (task, depends_on) = match &*self.shared.state.lock() {
            State::Ready(_) => return false,
            State::Pending {
                task, depends_on, ..
            } => (task.clone(), depends_on.clone()),
        };
        if task.is_some_and(|task| task.run()) {
            return true;
        }
        depends_on.iter().any(FutureHandle::help)
    }

    /// Record the job that will fulfill this handle.
    pub(crate) fn attach_task(&self, job: &Task) {
        let mut state = self.shared.state.lock();
        if let State::Pending { task, revision, .. } = &mut *state {
            *task = Some(TaskRef(Arc::downgrade(&job.job)));
            *revision += 1;
            drop(state);
            self.shared.ready.notify_all();
        }
    }

    /// Record handles that must complete before this one can.
    pub(crate) fn depends_on(&self, handles: impl IntoIterator<Item = FutureHandle>) {
        let mut state = self.shared.state.lock();
        if let State::Pending {
            depends_on,
            revision,
            ..
        } = &mut *state
        {
            depends_on.extend(handles);
            *revision += 1;
            drop(state);
            self.shared.ready.notify_all();
        }
    }

    /// Run `callback` once the handle is fulfilled.
    ///
    /// Runs immediately on the calling thread when the handle is already
    /// fulfilled, otherwise on the thread that fulfills it.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Pending { callbacks, .. } => callbacks.push(Box::new(callback)),
            State::Ready(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                callback(&outcome);
            }
        }
    }

    /// Derive a handle whose outcome is `transform` applied to this one.
    ///
    /// `transform` runs inline on the completing thread and must not block.
    pub fn map<F>(&self, transform: F) -> FutureHandle
    where
        F: FnOnce(&Outcome) -> Outcome + Send + 'static,
    {
        let (promise, handle) = promise();
        self.on_ready(move |outcome| promise.fulfill(transform(outcome)));
        handle
    }

    /// Whether both handles refer to the same underlying future.
    pub fn ptr_eq(&self, other: &FutureHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl PartialEq for FutureHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for FutureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_ready() { "ready" } else { "pending" };
        write!(f, "Future(#{} {})", self.shared.id, status)
    }
}

impl Future for FutureHandle {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Ready(outcome) => Poll::Ready(outcome.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// Write side of a [`FutureHandle`].
///
/// Dropping an unfulfilled promise fulfills its handle with
/// [`Error::BrokenPromise`] so readers never wait forever.
pub struct Promise {
    shared: Option<Arc<Shared>>,
}

impl Promise {
    /// The handle this promise fulfills.
    pub(crate) fn handle(&self) -> Option<FutureHandle> {
        self.shared.clone().map(|shared| FutureHandle { shared })
    }

    /// Fulfill the handle with `outcome`.
    pub fn fulfill(mut self, outcome: Outcome) {
        if let Some(shared) = self.shared.take() {
            shared.complete(outcome);
        }
    }

    /// Fulfill the handle with values.
    pub fn set_value(self, values: ArgList) {
        self.fulfill(Ok(values));
    }

    /// Fulfill the handle with a fault.
    pub fn set_fault(self, error: Error) {
        self.fulfill(Err(error));
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            tracing::debug!(future = shared.id, "promise dropped unfulfilled");
            shared.complete(Err(Error::BrokenPromise));
        }
    }
}
