//! Guards: exclusive-access gates that carry state.
//!
//! A guard owns an [`ArgList`] that is only read or written while the guard
//! is held. Several guards are acquired together as a [`GuardSet`], all at
//! once or not at all, so overlapping sets never deadlock on a partially
//! acquired subset.
//!
//! A set that cannot be acquired right away is queued on a process-wide
//! gate together with the work to start once it is granted. Releasing a set
//! grants queued sets in arrival order; a set is passed over only while one
//! of its guards is held or wanted by an earlier waiter. Nothing blocks a
//! thread while waiting for guards except [`GuardSet::acquire`].

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::value::ArgList;

static GATE: Lazy<Mutex<Gate>> = Lazy::new(|| Mutex::new(Gate::default()));

static DEFAULT_GUARD: Lazy<Guard> = Lazy::new(Guard::new);

type Start = Box<dyn FnOnce(HeldGuards) + Send>;

struct Waiter {
    set: GuardSet,
    start: Start,
}

#[derive(Default)]
struct Gate {
    /// Ids of every guard currently held.
    held: HashSet<Uuid>,
    waiting: VecDeque<Waiter>,
}

impl Gate {
    fn is_free(&self, set: &GuardSet, wanted: &HashSet<Uuid>) -> bool {
        set.ids().all(|id| !self.held.contains(&id) && !wanted.contains(&id))
    }

    fn take(&mut self, set: &GuardSet) {
        self.held.extend(set.ids());
    }

    /// Pop every waiter that can run now, marking its guards held.
    fn grant(&mut self) -> Vec<Waiter> {
        let mut wanted = HashSet::new();
        let mut granted = Vec::new();
        let mut still_waiting = VecDeque::with_capacity(self.waiting.len());
        while let Some(waiter) = self.waiting.pop_front() {
            if self.is_free(&waiter.set, &wanted) {
                self.take(&waiter.set);
                granted.push(waiter);
            } else {
                wanted.extend(waiter.set.ids());
                still_waiting.push_back(waiter);
            }
        }
        self.waiting = still_waiting;
        granted
    }
}

struct GuardInner {
    id: Uuid,
    state: Mutex<ArgList>,
}

/// Exclusive-access gate plus carried state.
#[derive(Clone)]
pub struct Guard {
    inner: Arc<GuardInner>,
}

impl Default for Guard {
    fn default() -> Self {
        Self::new()
    }
}

impl Guard {
    /// Guard with empty carried state.
    pub fn new() -> Self {
        Self::with_state(Vec::new())
    }

    /// Guard with initial carried state.
    pub fn with_state(state: ArgList) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                id: Uuid::new_v4(),
                state: Mutex::new(state),
            }),
        }
    }

    /// The process-wide guard used when no guard is named.
    pub fn default_guard() -> Guard {
        DEFAULT_GUARD.clone()
    }

    /// Unique identifier.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Copy of the carried state, read while holding the guard.
    pub fn snapshot(&self) -> ArgList {
        GuardSet::new(std::slice::from_ref(self))
            .acquire()
            .carried_state()
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard({})", self.inner.id)
    }
}

/// Guards acquired as one unit. Duplicates are dropped, order is kept.
#[derive(Debug, Clone)]
pub struct GuardSet {
    guards: Vec<Guard>,
}

impl GuardSet {
    /// Build a set from `guards`.
    pub fn new(guards: &[Guard]) -> Self {
        let mut seen = HashSet::new();
        let guards = guards
            .iter()
            .filter(|guard| seen.insert(guard.id()))
            .cloned()
            .collect();
        Self { guards }
    }

    /// Number of distinct guards.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    fn ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.guards.iter().map(Guard::id)
    }

    /// Call `start` with the held set once every guard is free.
    ///
    /// Runs `start` on the calling thread when the set is free now, and
    /// otherwise on the thread whose release makes it free.
    pub fn when_acquired<F>(&self, start: F)
    where
        F: FnOnce(HeldGuards) + Send + 'static,
    {
        let mut gate = GATE.lock();
        let wanted: HashSet<Uuid> = gate
            .waiting
            .iter()
            .flat_map(|waiter| waiter.set.ids())
            .collect();
        if gate.is_free(self, &wanted) {
            gate.take(self);
            drop(gate);
            tracing::trace!(guards = self.guards.len(), "guard set acquired");
            start(HeldGuards { set: self.clone() });
        } else {
            tracing::trace!(
                guards = self.guards.len(),
                queued = gate.waiting.len() + 1,
                "guard set queued"
            );
            gate.waiting.push_back(Waiter {
                set: self.clone(),
                start: Box::new(start),
            });
        }
    }

    /// Block the calling thread until every guard is free, then hold all of
    /// them.
    pub fn acquire(&self) -> HeldGuards {
        let (tx, rx) = mpsc::sync_channel(1);
        self.when_acquired(move |held| {
            // A receiver that is gone drops, and so releases, the set.
            let _ = tx.send(held);
        });
        match rx.recv() {
            Ok(held) => held,
            Err(_) => unreachable!("queued guard waiters are always started"),
        }
    }
}

/// Ownership of an acquired [`GuardSet`]; released on drop.
pub struct HeldGuards {
    set: GuardSet,
}

impl HeldGuards {
    /// Carried states of all guards, concatenated in guard order.
    pub fn carried_state(&self) -> ArgList {
        self.set
            .guards
            .iter()
            .flat_map(|guard| guard.inner.state.lock().clone())
            .collect()
    }

    /// Write `outputs` back into the carried states, round-robin.
    ///
    /// Output `i` replaces the state of guard `i % n`, so with more outputs
    /// than guards the last write to a guard wins. Guards that receive no
    /// output are left empty.
    pub fn redistribute(&self, outputs: ArgList) {
        let n = self.set.guards.len();
        if n == 0 {
            return;
        }
        let mut slots: Vec<ArgList> = vec![Vec::new(); n];
        for (i, value) in outputs.into_iter().enumerate() {
            slots[i % n] = vec![value];
        }
        for (guard, slot) in self.set.guards.iter().zip(slots) {
            *guard.inner.state.lock() = slot;
        }
    }
}

impl fmt::Debug for HeldGuards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HeldGuards").field(&self.set).finish()
    }
}

impl Drop for HeldGuards {
    fn drop(&mut self) {
        let granted = {
            let mut gate = GATE.lock();
            for id in self.set.ids() {
                gate.held.remove(&id);
            }
            gate.grant()
        };
        for waiter in granted {
            tracing::trace!(guards = waiter.set.len(), "guard set acquired");
            (waiter.start)(HeldGuards { set: waiter.set });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn n(x: f64) -> Value {
        Value::Number(x)
    }

    #[test]
    fn redistribution_is_round_robin() {
        let a = Guard::with_state(vec![n(1.0)]);
        let b = Guard::with_state(vec![n(2.0)]);
        let set = GuardSet::new(&[a.clone(), b.clone()]);
        {
            let held = set.acquire();
            assert_eq!(held.carried_state(), vec![n(1.0), n(2.0)]);
            held.redistribute(vec![n(10.0), n(20.0), n(30.0)]);
        }
        assert_eq!(a.snapshot(), vec![n(30.0)]);
        assert_eq!(b.snapshot(), vec![n(20.0)]);

        {
            let held = set.acquire();
            held.redistribute(vec![n(5.0)]);
        }
        assert_eq!(a.snapshot(), vec![n(5.0)]);
        assert!(b.snapshot().is_empty());
    }

    #[test]
    fn queued_sets_start_on_release_in_order() {
        let a = Guard::new();
        let b = Guard::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let held = GuardSet::new(&[a.clone()]).acquire();

        for (label, guards) in [("ab", vec![a.clone(), b.clone()]), ("b", vec![b.clone()])] {
            let order = order.clone();
            GuardSet::new(&guards).when_acquired(move |_held| order.lock().push(label));
        }
        // `b` alone is free, but an earlier waiter wants it.
        assert!(order.lock().is_empty());

        drop(held);
        assert_eq!(*order.lock(), vec!["ab", "b"]);
    }

    #[test]
    fn when_acquired_does_not_block() {
        let a = Guard::with_state(vec![n(1.0)]);
        let held = GuardSet::new(&[a.clone()]).acquire();
        let started = Arc::new(AtomicBool::new(false));
        {
            let started = started.clone();
            GuardSet::new(&[a.clone()]).when_acquired(move |held| {
                held.redistribute(vec![n(2.0)]);
                started.store(true, Ordering::SeqCst);
            });
        }
        assert!(!started.load(Ordering::SeqCst));
        drop(held);
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(a.snapshot(), vec![n(2.0)]);
    }

    #[test]
    fn duplicates_collapse() {
        let a = Guard::new();
        let set = GuardSet::new(&[a.clone(), a.clone()]);
        assert_eq!(set.len(), 1);
        // Acquiring a set with a repeated guard must not self-deadlock.
        drop(set.acquire());
    }

    #[test]
    fn overlapping_sets_never_run_together() {
        let a = Guard::new();
        let b = Guard::new();
        let c = Guard::new();
        let busy_a = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let sets = vec![
            GuardSet::new(&[a.clone(), b.clone()]),
            GuardSet::new(&[b.clone(), c.clone()]),
            GuardSet::new(&[c.clone(), a.clone()]),
            GuardSet::new(&[a.clone()]),
        ];

        let workers: Vec<_> = sets
            .into_iter()
            .map(|set| {
                let busy_a = busy_a.clone();
                let overlaps = overlaps.clone();
                let uses_a = set.guards.iter().any(|g| g.id() == a.id());
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _held = set.acquire();
                        if uses_a && busy_a.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_micros(200));
                        if uses_a {
                            busy_a.store(false, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_guard_is_shared() {
        assert_eq!(Guard::default_guard().id(), Guard::default_guard().id());
        assert_ne!(Guard::new().id(), Guard::new().id());
    }
}
