//! Script-facing operations.
//!
//! Installed into every interpreter a node creates. Each builtin holds a
//! weak reference to its node so interpreters parked in thread-local
//! storage never keep a stopped node alive.

use std::sync::{Arc, Weak};

use crate::codec;
use crate::combinators;
use crate::dataflow::Target;
use crate::error::{Error, Result};
use crate::future::FutureHandle;
use crate::guard::Guard;
use crate::node::NodeShared;
use crate::script::{Interpreter, ScriptError, ScriptResult, ScriptValue};
use crate::transport::Locality;
use crate::value::ArgList;

/// Register the node builtins on `interp`.
pub(crate) fn install(interp: &mut Interpreter, node: Weak<NodeShared>) {
    let weak = node.clone();
    interp.register_native("async", move |_, args| {
        let node = upgrade(&weak)?;
        let (locality, target, args) = call_args("async", args)?;
        let handle = match locality {
            Some(locality) => node.async_at(locality, target, args),
            None => node.async_call(target, args),
        };
        Ok(vec![ScriptValue::Future(handle)])
    });

    let weak = node.clone();
    interp.register_native("dataflow", move |_, args| {
        let node = upgrade(&weak)?;
        let (locality, target, args) = call_args("dataflow", args)?;
        let handle = match locality {
            Some(locality) => node.dataflow_at(locality, target, args),
            None => node.dataflow(target, args),
        };
        Ok(vec![ScriptValue::Future(handle)])
    });

    let weak = node.clone();
    interp.register_native("then", move |_, args| {
        let node = upgrade(&weak)?;
        let mut args = args.into_iter();
        let handle = match args.next() {
            Some(ScriptValue::Future(handle)) => handle,
            _ => return Err(usage("then expects a future and a function")),
        };
        let target = match args.next() {
            Some(value) => Target::from_script(&value)?,
            None => return Err(usage("then expects a future and a function")),
        };
        let extra = pack_args(args)?;
        Ok(vec![ScriptValue::Future(node.then(&handle, target, extra))])
    });

    let weak = node.clone();
    interp.register_native("run-guarded", move |_, mut args| {
        let node = upgrade(&weak)?;
        let target = match args.pop() {
            Some(value) => Target::from_script(&value)?,
            None => return Err(usage("run-guarded expects guards followed by a function")),
        };
        let guards = args
            .into_iter()
            .map(|value| match value {
                ScriptValue::Guard(guard) => Ok(guard),
                other => Err(usage(format!(
                    "run-guarded expects guards, got {}",
                    other.type_name()
                ))),
            })
            .collect::<ScriptResult<Vec<_>>>()?;
        Ok(vec![ScriptValue::Future(node.run_guarded(target, &guards))])
    });

    let weak = node.clone();
    interp.register_native("register", move |interp, args| {
        let node = upgrade(&weak)?;
        let names = args
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| usage("register expects function names"))
            })
            .collect::<ScriptResult<Vec<_>>>()?;
        node.register_from(interp, &names)?;
        Ok(Vec::new())
    });

    let weak = node.clone();
    interp.register_native("unwrap", move |_, args| {
        let node = upgrade(&weak)?;
        let depth = node.config().max_unwrap_depth;
        args.into_iter()
            .map(|value| match value {
                ScriptValue::Future(handle) => Ok(match combinators::unwrap(&handle, depth)? {
                    Some(inner) => codec::unpack(&inner),
                    None => ScriptValue::Future(handle),
                }),
                other => Ok(other),
            })
            .collect()
    });

    let weak = node.clone();
    interp.register_native("here", move |_, _| {
        Ok(vec![ScriptValue::Locality(upgrade(&weak)?.locality())])
    });
    let weak = node.clone();
    interp.register_native("root", move |_, _| {
        Ok(vec![ScriptValue::Locality(upgrade(&weak)?.root())])
    });
    let weak = node.clone();
    interp.register_native("all", move |_, _| {
        Ok(vec![localities(upgrade(&weak)?.all())])
    });
    let weak = node;
    interp.register_native("remote", move |_, _| {
        Ok(vec![localities(upgrade(&weak)?.remote())])
    });

    install_futures(interp);
}

/// Builtins that need no node.
fn install_futures(interp: &mut Interpreter) {
    interp.register_native("get", |_, args| match args.first() {
        Some(ScriptValue::Future(handle)) => {
            let values = handle.get()?;
            Ok(codec::unpack_all(&values))
        }
        _ => Err(usage("get expects a future")),
    });

    interp.register_native("wait-all", |_, args| {
        let handles = future_args("wait-all", &args)?;
        Ok(vec![ScriptValue::Future(combinators::wait_all(&handles))])
    });

    interp.register_native("when-all", |_, args| {
        let handles = future_args("when-all", &args)?;
        Ok(vec![ScriptValue::Future(combinators::when_all(&handles))])
    });

    interp.register_native("when-any", |_, args| {
        let handles = future_args("when-any", &args)?;
        Ok(vec![ScriptValue::Future(combinators::when_any(&handles))])
    });

    interp.register_native("make-ready-future", |_, args| {
        let values = pack_args(args)?;
        Ok(vec![ScriptValue::Future(FutureHandle::ready(values))])
    });

    interp.register_native("is-future", |_, args| {
        let flag = matches!(args.first(), Some(ScriptValue::Future(_)));
        Ok(vec![ScriptValue::Number(if flag { 1.0 } else { 0.0 })])
    });

    interp.register_native("new-guard", |_, args| {
        let state = pack_args(args)?;
        Ok(vec![ScriptValue::Guard(Guard::with_state(state))])
    });
}

fn upgrade(node: &Weak<NodeShared>) -> ScriptResult<Arc<NodeShared>> {
    node.upgrade()
        .ok_or_else(|| ScriptError::Host(Error::Executor("node has stopped".into())))
}

fn usage(message: impl Into<String>) -> ScriptError {
    ScriptError::Runtime(message.into())
}

fn pack_args(args: impl IntoIterator<Item = ScriptValue>) -> Result<ArgList> {
    args.into_iter().map(|value| codec::pack(&value)).collect()
}

/// Split `[locality] target args...`.
fn call_args(
    op: &str,
    args: Vec<ScriptValue>,
) -> ScriptResult<(Option<Locality>, Target, ArgList)> {
    let mut args = args.into_iter().peekable();
    let locality = match args.peek() {
        Some(ScriptValue::Locality(locality)) => {
            let locality = *locality;
            args.next();
            Some(locality)
        }
        _ => None,
    };
    let target = match args.next() {
        Some(value) => Target::from_script(&value)?,
        None => return Err(usage(format!("{} expects a function", op))),
    };
    Ok((locality, target, pack_args(args)?))
}

/// Futures passed either as separate arguments or as one table.
fn future_args(op: &str, args: &[ScriptValue]) -> ScriptResult<Vec<FutureHandle>> {
    let items = match args {
        [ScriptValue::Table(table)] => table.borrow().sequence_values(),
        _ => args.to_vec(),
    };
    items
        .into_iter()
        .map(|item| match item {
            ScriptValue::Future(handle) => Ok(handle),
            other => Err(usage(format!(
                "{} expects futures, got {}",
                op,
                other.type_name()
            ))),
        })
        .collect()
}

fn localities(list: Vec<Locality>) -> ScriptValue {
    ScriptValue::sequence(list.into_iter().map(ScriptValue::Locality))
}

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::node::{Cluster, Node};
    use crate::value::{Key, Value};

    fn n(x: f64) -> Value {
        Value::Number(x)
    }

    fn node() -> Node {
        Node::new(NodeConfig::default()).unwrap()
    }

    #[test]
    fn ready_futures_and_get() {
        let node = node();
        let out = node.eval("(get (make-ready-future 1 \"two\"))").unwrap();
        assert_eq!(out, vec![n(1.0), Value::string("two")]);
        assert_eq!(node.eval("(is-future (make-ready-future))").unwrap(), vec![n(1.0)]);
        assert_eq!(node.eval("(is-future 5)").unwrap(), vec![n(0.0)]);
        assert!(node.eval("(get 5)").is_err());
    }

    #[test]
    fn when_any_reports_index_from_a_table() {
        let node = node();
        let out = node
            .eval(
                "(let ((r (get (when-any (list (make-ready-future 1))))))
                   (index r \"index\"))",
            )
            .unwrap();
        assert_eq!(out, vec![n(1.0)]);

        let Value::Table(map) = &node.eval("(get (when-any))").unwrap()[0] else {
            panic!("expected table");
        };
        assert_eq!(map[&Key::from("index")], n(0.0));
    }

    #[test]
    fn when_all_and_wait_all() {
        let node = node();
        let out = node
            .eval(
                "(let ((futs (get (when-all (make-ready-future 1) (make-ready-future 2)))))
                   (+ (get (index futs 1)) (get (index futs 2))))",
            )
            .unwrap();
        assert_eq!(out, vec![n(3.0)]);
        assert!(node.eval("(get (wait-all (make-ready-future 1)))").unwrap().is_empty());
    }

    #[test]
    fn unwrap_resolves_chains_in_place() {
        let node = node();
        let out = node
            .eval("(unwrap 1 (make-ready-future (make-ready-future 7)) (make-ready-future 1 2))")
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], n(1.0));
        assert_eq!(out[1], n(7.0));
        assert!(out[2].is_future());
    }

    #[test]
    fn async_accepts_inline_functions() {
        let node = node();
        let out = node.eval("(get (async (fn (x) (* x 3)) 5))").unwrap();
        assert_eq!(out, vec![n(15.0)]);
    }

    #[test]
    fn locality_builtins() {
        let cluster = Cluster::new(2, NodeConfig::default()).unwrap();
        let node = cluster.node(crate::transport::Locality(1)).unwrap();
        assert_eq!(node.eval("(len (all))").unwrap(), vec![n(2.0)]);
        assert_eq!(node.eval("(len (remote))").unwrap(), vec![n(1.0)]);
        assert_eq!(
            node.eval("(str (here) \" \" (root))").unwrap(),
            vec![Value::string("locality#1 locality#0")]
        );
    }

    #[test]
    fn dataflow_at_a_remote_locality() {
        let cluster = Cluster::new(2, NodeConfig::default()).unwrap();
        let root = cluster.root();
        root.eval("(defn twice (x) (* 2 x)) (register \"twice\")").unwrap();
        let out = root
            .eval("(get (dataflow (index (remote) 1) \"twice\" (make-ready-future 4)))")
            .unwrap();
        assert_eq!(out, vec![n(8.0)]);
    }
}
