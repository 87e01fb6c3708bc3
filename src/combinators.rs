//! Future combinators: wait-for-all, when-all, first-of and unwrapping.
//!
//! Combinator results use the same shapes scripts see: [`when_all`] yields
//! one array of the input futures, [`when_any`] yields one table with the
//! 1-based `index` of the first completed input and the `futures` array.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::future::{FutureHandle, promise};
use crate::value::{ArgList, Key, TableMap, Value};

/// Run `done` once every handle in `handles` is fulfilled.
///
/// Runs inline when `handles` is empty or already fulfilled.
pub(crate) fn on_all_ready<F>(handles: &[FutureHandle], done: F)
where
    F: FnOnce() + Send + 'static,
{
    if handles.is_empty() {
        done();
        return;
    }

    let remaining = Arc::new(AtomicUsize::new(handles.len()));
    let done = Arc::new(Mutex::new(Some(done)));
    for handle in handles {
        let remaining = remaining.clone();
        let done = done.clone();
        handle.on_ready(move |_| {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                if let Some(done) = done.lock().take() {
                    done();
                }
            }
        });
    }
}

/// A handle fulfilled with an empty [`ArgList`] once every input is fulfilled.
///
/// Faults of individual inputs are not propagated; read the inputs to see them.
pub fn wait_all(handles: &[FutureHandle]) -> FutureHandle {
    let (promise, handle) = promise();
    handle.depends_on(handles.iter().cloned());
    on_all_ready(handles, move || promise.set_value(Vec::new()));
    handle
}

/// A handle fulfilled once every input is fulfilled.
///
/// The single result element is an array holding the inputs in input order,
/// independent of the order in which they completed.
pub fn when_all(handles: &[FutureHandle]) -> FutureHandle {
    let (promise, handle) = promise();
    handle.depends_on(handles.iter().cloned());
    let ordered: Vec<Value> = handles.iter().cloned().map(Value::FutureRef).collect();
    on_all_ready(handles, move || promise.set_value(vec![Value::Array(ordered)]));
    handle
}

/// A handle fulfilled as soon as the first input completes.
///
/// The single result element is a table `{index, futures}` where `index` is
/// the 1-based position of the input that completed first. An empty input
/// list reports index 0.
pub fn when_any(handles: &[FutureHandle]) -> FutureHandle {
    let (promise, handle) = promise();
    if handles.is_empty() {
        promise.set_value(vec![when_any_result(0, handles)]);
        return handle;
    }

    handle.depends_on(handles.iter().cloned());
    let slot = Arc::new(Mutex::new(Some(promise)));
    let inputs: Arc<Vec<FutureHandle>> = Arc::new(handles.to_vec());
    for (position, input) in handles.iter().enumerate() {
        let slot = slot.clone();
        let inputs = inputs.clone();
        input.on_ready(move |_| {
            if let Some(promise) = slot.lock().take() {
                promise.set_value(vec![when_any_result(position + 1, &inputs)]);
            }
        });
    }
    handle
}

fn when_any_result(index: usize, handles: &[FutureHandle]) -> Value {
    let mut table = TableMap::new();
    table.insert(Key::from("index"), Value::Number(index as f64));
    table.insert(
        Key::from("futures"),
        Value::Array(handles.iter().cloned().map(Value::FutureRef).collect()),
    );
    Value::Table(table)
}

/// Resolve a future-of-future chain.
///
/// Returns `Some(value)` when the chain ends in a single non-future element,
/// and `None` when a link resolves to zero or several values, in which case
/// the caller keeps its original slot. Fails with
/// [`Error::UnwrapDepthExceeded`] when more than `max_depth` futures are
/// chained.
pub fn unwrap(handle: &FutureHandle, max_depth: usize) -> Result<Option<Value>> {
    let mut current = handle.clone();
    for _ in 0..max_depth {
        let mut values = current.get()?;
        if values.len() != 1 {
            return Ok(None);
        }
        match values.remove(0) {
            Value::FutureRef(inner) => current = inner,
            other => return Ok(Some(other)),
        }
    }
    Err(Error::UnwrapDepthExceeded(max_depth))
}

/// Unwrap every future of `slots` in place, leaving other values untouched.
pub fn unwrap_slots(slots: &mut ArgList, max_depth: usize) -> Result<()> {
    for slot in slots.iter_mut() {
        if let Value::FutureRef(handle) = slot {
            if let Some(value) = unwrap(handle, max_depth)? {
                *slot = value;
            }
        }
    }
    Ok(())
}

/// Extract the futures from a [`when_all`] / [`when_any`] array value.
pub fn futures_of(value: &Value) -> Vec<FutureHandle> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_future().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::promise;

    fn num(n: f64) -> ArgList {
        vec![Value::Number(n)]
    }

    #[test]
    fn when_all_preserves_input_order() {
        let (p1, f1) = promise();
        let (p2, f2) = promise();
        let (p3, f3) = promise();
        let all = when_all(&[f1.clone(), f2.clone(), f3.clone()]);

        // Complete out of order: f2, then f3, then f1.
        p2.set_value(num(2.0));
        p3.set_value(num(3.0));
        assert!(!all.is_ready());
        p1.set_value(num(1.0));

        let result = all.get().unwrap();
        assert_eq!(result.len(), 1);
        let futures = futures_of(&result[0]);
        let values: Vec<ArgList> = futures.iter().map(|f| f.get().unwrap()).collect();
        assert_eq!(values, vec![num(1.0), num(2.0), num(3.0)]);
        assert!(futures[0].ptr_eq(&f1));
        assert!(futures[1].ptr_eq(&f2));
        assert!(futures[2].ptr_eq(&f3));
    }

    #[test]
    fn when_any_reports_first_completed_index() {
        let ready = FutureHandle::ready(num(1.0));
        let (_pending_promise, pending) = promise();

        let first = when_any(&[ready.clone(), pending.clone()]).get().unwrap();
        let Value::Table(table) = &first[0] else {
            panic!("expected table, got {:?}", first);
        };
        assert_eq!(table.get(&Key::from("index")), Some(&Value::Number(1.0)));
        assert_eq!(futures_of(&table[&Key::from("futures")]).len(), 2);

        let mirrored = when_any(&[pending, ready]).get().unwrap();
        let Value::Table(table) = &mirrored[0] else {
            panic!("expected table, got {:?}", mirrored);
        };
        assert_eq!(table.get(&Key::from("index")), Some(&Value::Number(2.0)));
    }

    #[test]
    fn when_any_of_nothing_is_ready() {
        let result = when_any(&[]).get().unwrap();
        let Value::Table(table) = &result[0] else {
            panic!("expected table");
        };
        assert_eq!(table.get(&Key::from("index")), Some(&Value::Number(0.0)));
    }

    #[test]
    fn wait_all_fires_after_every_input() {
        let (p1, f1) = promise();
        let f2 = FutureHandle::ready(Vec::new());
        let all = wait_all(&[f1, f2]);
        assert!(!all.is_ready());
        p1.set_fault(Error::Script("boom".into()));
        assert_eq!(all.get(), Ok(Vec::new()));
        assert_eq!(wait_all(&[]).get(), Ok(Vec::new()));
    }

    #[test]
    fn unwrap_resolves_nested_futures() {
        let inner = FutureHandle::ready(num(7.0));
        let middle = FutureHandle::ready(vec![Value::FutureRef(inner)]);
        let outer = FutureHandle::ready(vec![Value::FutureRef(middle)]);
        assert_eq!(unwrap(&outer, 8), Ok(Some(Value::Number(7.0))));
    }

    #[test]
    fn unwrap_leaves_multi_valued_results_alone() {
        let inner = FutureHandle::ready(num(7.0));
        let pair = FutureHandle::ready(vec![Value::Number(1.0), Value::FutureRef(inner)]);
        assert_eq!(unwrap(&pair, 8), Ok(None));

        let mut slots = vec![Value::FutureRef(pair.clone()), Value::Number(3.0)];
        unwrap_slots(&mut slots, 8).unwrap();
        assert!(slots[0].as_future().unwrap().ptr_eq(&pair));
        assert_eq!(slots[1], Value::Number(3.0));
    }

    #[test]
    fn unwrap_depth_is_bounded() {
        let mut chain = FutureHandle::ready(num(1.0));
        for _ in 0..10 {
            chain = FutureHandle::ready(vec![Value::FutureRef(chain)]);
        }
        assert_eq!(unwrap(&chain, 4), Err(Error::UnwrapDepthExceeded(4)));
        assert_eq!(unwrap(&chain, 11), Ok(Some(Value::Number(1.0))));
    }
}
