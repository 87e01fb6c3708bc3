//! Integration tests for function registration and replication
//!
//! Registering publishes the whole registry to every node; receiving nodes
//! replace their registry wholesale.

use std::sync::Arc;

use xscript::script::{BYTECODE_SIGNATURE, Bytecode, Interpreter};
use xscript::{Cluster, Error, FunctionTable, Locality, Node, NodeConfig, Value};

fn n(x: f64) -> Value {
    Value::Number(x)
}

fn compile(source: &str, name: &str) -> Bytecode {
    let mut interp = Interpreter::new();
    interp.eval_source(source).unwrap();
    interp.dump_global(name).unwrap()
}

#[test]
fn test_replace_drops_previous_entries() {
    let node = Node::new(NodeConfig::default()).unwrap();
    node.eval("(defn a () 1) (defn b () 2)").unwrap();
    node.register(&["a", "b"]).unwrap();
    assert_eq!(node.async_call("a", Vec::new()).get().unwrap(), vec![n(1.0)]);
    assert_eq!(node.async_call("b", Vec::new()).get().unwrap(), vec![n(2.0)]);

    let mut next = FunctionTable::new();
    next.insert("c".into(), compile("(defn c () 3)", "c"));
    node.apply_registry(Arc::new(next)).get().unwrap();

    assert_eq!(node.registry().names(), vec!["c".to_string()]);
    assert!(node.async_call("a", Vec::new()).get().unwrap().is_empty());
    assert!(node.async_call("b", Vec::new()).get().unwrap().is_empty());
    assert_eq!(node.async_call("c", Vec::new()).get().unwrap(), vec![n(3.0)]);
}

#[test]
fn test_replacement_is_observed_by_warm_contexts() {
    let node = Node::new(NodeConfig::default()).unwrap();
    node.eval("(defn version () 1)").unwrap();
    node.register(&["version"]).unwrap();
    for _ in 0..4 {
        assert_eq!(node.async_call("version", Vec::new()).get().unwrap(), vec![n(1.0)]);
    }

    let mut next = FunctionTable::new();
    next.insert("version".into(), compile("(defn version () 2)", "version"));
    node.apply_registry(Arc::new(next)).get().unwrap();

    for _ in 0..4 {
        assert_eq!(node.async_call("version", Vec::new()).get().unwrap(), vec![n(2.0)]);
    }
}

#[test]
fn test_broadcast_converges() {
    let cluster = Cluster::new(3, NodeConfig::default()).unwrap();
    let root = cluster.root();
    root.eval("(defn square (x) (* x x)) (defn cube (x) (* x x x))")
        .unwrap();
    root.register(&["square"]).unwrap();
    root.register(&["cube"]).unwrap();

    let digest = root.registry().digest();
    for node in cluster.nodes() {
        assert_eq!(node.registry().digest(), digest);
        assert_eq!(node.registry().len(), 2);
        let out = node.async_call("cube", vec![n(3.0)]).get().unwrap();
        assert_eq!(out, vec![n(27.0)]);
    }

    for locality in root.remote() {
        let out = root.dataflow_at(locality, "square", vec![n(5.0)]).get().unwrap();
        assert_eq!(out, vec![n(25.0)]);
    }
}

#[test]
fn test_register_from_a_remote_node() {
    let cluster = Cluster::new(3, NodeConfig::default()).unwrap();
    let origin = cluster.node(Locality(2)).unwrap();
    origin
        .eval("(defn hello () \"hi\") (register \"hello\")")
        .unwrap();

    for node in cluster.nodes() {
        let out = node.async_call("hello", Vec::new()).get().unwrap();
        assert_eq!(out, vec![Value::string("hi")]);
    }
}

#[test]
fn test_corrupt_entry_reports_remote_fault() {
    let cluster = Cluster::new(2, NodeConfig::default()).unwrap();
    let root = cluster.root();
    root.registry().insert(
        "broken",
        Bytecode::from_raw(format!("{}garbage", BYTECODE_SIGNATURE)),
    );

    match root.broadcast_registry() {
        Err(Error::RemoteFault { locality, message }) => {
            assert_eq!(locality, Locality(1));
            assert!(message.contains("broken"));
        }
        other => panic!("expected a remote fault, got {:?}", other),
    }

    // The remote kept the table it was sent.
    let remote = cluster.node(Locality(1)).unwrap();
    assert_eq!(remote.registry().names(), vec!["broken".to_string()]);
}

#[test]
fn test_register_rejects_non_functions() {
    let cluster = Cluster::new(2, NodeConfig::default()).unwrap();
    let root = cluster.root();
    let err = root.eval("(define x 5) (register \"x\")").unwrap_err();
    assert_eq!(err, Error::FunctionNotFound("x".into()));
    assert!(cluster.node(Locality(1)).unwrap().registry().is_empty());
}
