//! Function lookup, invocation and future resolution around a call.
//!
//! [`invoke`] runs a [`Target`] on a leased execution context. The dataflow
//! discipline wraps it: [`resolve_inputs`] waits for every future argument
//! and splices its values into place before the call, and
//! [`resolve_outputs`] does the same to the results before the caller sees
//! them.

use std::fmt;

use crate::codec;
use crate::combinators::on_all_ready;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::future::FutureHandle;
use crate::registry::FunctionRegistry;
use crate::script::{self, Bytecode, ScriptValue};
use crate::value::{ArgList, Value};

/// What to run: a function name or a dumped function.
#[derive(Clone, PartialEq)]
pub enum Target {
    /// Resident global or registry entry
    Name(String),
    /// Inline function code
    Code(Bytecode),
}

impl Target {
    /// Name used in diagnostics.
    pub fn label(&self) -> &str {
        match self {
            Target::Name(name) => name,
            Target::Code(_) => "<anonymous>",
        }
    }

    /// Interpret a script value as a target.
    ///
    /// Strings carrying the bytecode signature are code, other strings are
    /// names. Script functions are dumped; builtins are referenced by name.
    pub fn from_script(value: &ScriptValue) -> Result<Target> {
        match value {
            ScriptValue::Str(text) => Ok(Target::from(&**text)),
            ScriptValue::Function(function) => Ok(Target::Code(script::dump(function)?)),
            ScriptValue::Native(native) => Ok(Target::Name(native.name.clone())),
            other => Err(Error::Script(format!(
                "expected a function or function name, got {}",
                other.type_name()
            ))),
        }
    }
}

impl From<&str> for Target {
    fn from(text: &str) -> Self {
        if script::is_bytecode(text) {
            Target::Code(Bytecode::from_raw(text))
        } else {
            Target::Name(text.to_string())
        }
    }
}

impl From<String> for Target {
    fn from(text: String) -> Self {
        if script::is_bytecode(&text) {
            Target::Code(Bytecode::from_raw(text))
        } else {
            Target::Name(text)
        }
    }
}

impl From<Bytecode> for Target {
    fn from(code: Bytecode) -> Self {
        Target::Code(code)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Name(name) => write!(f, "Target({})", name),
            Target::Code(code) => write!(f, "Target({:?})", code),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Find the function for `target` in the context, loading it from the
/// registry on a miss.
fn resolve(
    context: &mut ExecutionContext,
    registry: &FunctionRegistry,
    target: &Target,
) -> Result<ScriptValue> {
    match target {
        Target::Name(name) => {
            if let Some(resident) = context.interpreter().global(name) {
                if resident.is_callable() {
                    return Ok(resident);
                }
            }
            let code = registry
                .lookup(name)
                .ok_or_else(|| Error::FunctionNotFound(name.clone()))?;
            let function = load(context, &code, name, Some(name))?;
            tracing::debug!(function = %name, "loaded function from registry");
            context.memoize(name, function.clone());
            Ok(function)
        }
        Target::Code(code) => load(context, code, target.label(), None),
    }
}

fn load(
    context: &mut ExecutionContext,
    code: &Bytecode,
    label: &str,
    name: Option<&str>,
) -> Result<ScriptValue> {
    context
        .interpreter()
        .load(code, name)
        .map_err(|err| Error::CompileError {
            name: label.to_string(),
            size: code.len(),
            reason: err.to_string(),
        })
}

/// Run `target` with `args` on `context`.
///
/// A missing function, a function that fails to load and a script fault
/// are logged and produce an empty result. Only output packing failures
/// are returned as errors.
pub fn invoke(
    context: &mut ExecutionContext,
    registry: &FunctionRegistry,
    target: &Target,
    args: ArgList,
) -> Result<ArgList> {
    let function = match resolve(context, registry, target) {
        Ok(function) => function,
        Err(Error::FunctionNotFound(name)) => {
            tracing::warn!(function = %name, "function is not defined");
            return Ok(Vec::new());
        }
        Err(Error::CompileError { name, size, reason }) => {
            tracing::error!(function = %name, size, reason = %reason, "failed to load function");
            return Ok(Vec::new());
        }
        Err(other) => return Err(other),
    };

    let inputs = codec::unpack_all(&args);
    match context.interpreter().call(&function, inputs) {
        Ok(outputs) => codec::pack_all(&outputs),
        Err(err) => {
            tracing::error!(function = %target, error = %err, "script fault");
            Ok(Vec::new())
        }
    }
}

/// Top-level futures of `values`.
fn pending_futures(values: &[Value]) -> Vec<FutureHandle> {
    values
        .iter()
        .filter_map(|value| value.as_future().cloned())
        .collect()
}

/// Replace every future slot with all the values it resolved to.
///
/// Every future must already be fulfilled; a faulted one fails the splice.
fn splice(values: ArgList) -> Result<ArgList> {
    let mut spliced = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::FutureRef(handle) => {
                let outcome = handle.try_get().ok_or(Error::BrokenPromise)?;
                spliced.extend(outcome?);
            }
            other => spliced.push(other),
        }
    }
    Ok(spliced)
}

/// Wait for every future argument, then call `done` with the spliced list.
///
/// Does not block: `done` runs on the thread that fulfills the last input,
/// or inline when nothing is pending.
pub fn resolve_inputs<F>(args: ArgList, done: F)
where
    F: FnOnce(Result<ArgList>) + Send + 'static,
{
    let pending = pending_futures(&args);
    on_all_ready(&pending, move || done(splice(args)));
}

/// Block until the futures among `values` are resolved and spliced, for at
/// most `max_rounds` rounds.
pub fn resolve_outputs(mut values: ArgList, max_rounds: usize) -> Result<ArgList> {
    for _ in 0..max_rounds {
        let pending = pending_futures(&values);
        if pending.is_empty() {
            return Ok(values);
        }
        for handle in &pending {
            handle.wait();
        }
        values = splice(values)?;
    }
    if pending_futures(&values).is_empty() {
        Ok(values)
    } else {
        Err(Error::UnwrapDepthExceeded(max_rounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextPool;
    use crate::future::promise;
    use std::sync::Arc;
    use std::sync::mpsc;
    use uuid::Uuid;

    fn n(x: f64) -> Value {
        Value::Number(x)
    }

    fn setup() -> (ContextPool, Arc<FunctionRegistry>) {
        let registry = Arc::new(FunctionRegistry::new());
        let pool = ContextPool::new(Uuid::new_v4(), "test", registry.clone(), 64);
        (pool, registry)
    }

    #[test]
    fn targets_from_text() {
        assert_eq!(Target::from("double"), Target::Name("double".into()));
        let code = format!("{}{{}}", script::BYTECODE_SIGNATURE);
        assert!(matches!(Target::from(code.as_str()), Target::Code(_)));
    }

    #[test]
    fn invokes_resident_globals() {
        let (pool, registry) = setup();
        let mut lease = pool.try_acquire().unwrap();
        lease.interpreter().eval_source("(defn double (x) (* x 2))").unwrap();
        let out = invoke(&mut lease, &registry, &Target::from("double"), vec![n(21.0)]).unwrap();
        assert_eq!(out, vec![n(42.0)]);
    }

    #[test]
    fn loads_and_memoizes_registry_entries() {
        let (pool, registry) = setup();
        let code = {
            let mut scratch = crate::script::Interpreter::new();
            scratch.eval_source("(defn inc (x) (+ x 1))").unwrap();
            scratch.dump_global("inc").unwrap()
        };
        registry.insert("inc", code);

        let mut lease = pool.try_acquire().unwrap();
        let out = invoke(&mut lease, &registry, &Target::from("inc"), vec![n(1.0)]).unwrap();
        assert_eq!(out, vec![n(2.0)]);
        assert!(lease.is_memoized("inc"));
    }

    #[test]
    fn misses_and_faults_yield_nothing() {
        let (pool, registry) = setup();
        registry.insert(
            "broken",
            Bytecode::from_raw(format!("{}garbage", script::BYTECODE_SIGNATURE)),
        );
        let mut lease = pool.try_acquire().unwrap();
        lease.interpreter().eval_source("(defn boom () (error \"no\"))").unwrap();

        for name in ["missing", "broken", "boom"] {
            let out = invoke(&mut lease, &registry, &Target::from(name), Vec::new()).unwrap();
            assert!(out.is_empty(), "{} should produce nothing", name);
        }
    }

    #[test]
    fn unsupported_outputs_fail() {
        let (pool, registry) = setup();
        let mut lease = pool.try_acquire().unwrap();
        lease.interpreter().eval_source("(defn leak () print)").unwrap();
        let err = invoke(&mut lease, &registry, &Target::from("leak"), Vec::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[test]
    fn inputs_are_spliced_in_place() {
        let (first, first_handle) = promise();
        let (tx, rx) = mpsc::channel();
        let args = vec![
            n(1.0),
            Value::FutureRef(first_handle),
            Value::FutureRef(FutureHandle::ready(Vec::new())),
            n(4.0),
        ];
        resolve_inputs(args, move |resolved| tx.send(resolved).unwrap());
        assert!(rx.try_recv().is_err());

        first.set_value(vec![n(2.0), n(3.0)]);
        assert_eq!(rx.recv().unwrap().unwrap(), vec![n(1.0), n(2.0), n(3.0), n(4.0)]);
    }

    #[test]
    fn faulted_inputs_fail_the_call() {
        let (tx, rx) = mpsc::channel();
        let args = vec![Value::FutureRef(FutureHandle::faulted(Error::Script("x".into())))];
        resolve_inputs(args, move |resolved| tx.send(resolved).unwrap());
        assert_eq!(rx.recv().unwrap(), Err(Error::Script("x".into())));
    }

    #[test]
    fn outputs_resolve_through_nested_futures() {
        let inner = FutureHandle::ready(vec![n(7.0)]);
        let outer = FutureHandle::ready(vec![Value::FutureRef(inner)]);
        let out = resolve_outputs(vec![Value::FutureRef(outer), n(1.0)], 4).unwrap();
        assert_eq!(out, vec![n(7.0), n(1.0)]);

        let inner = FutureHandle::ready(vec![n(7.0)]);
        let outer = FutureHandle::ready(vec![Value::FutureRef(inner)]);
        assert_eq!(
            resolve_outputs(vec![Value::FutureRef(outer)], 1),
            Err(Error::UnwrapDepthExceeded(1))
        );
    }
}
