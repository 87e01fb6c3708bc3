//! Replicated name-to-bytecode store.
//!
//! A [`FunctionRegistry`] holds one immutable [`FunctionTable`] behind an
//! atomic swap. Readers always see either the old or the new table in full.
//! Every change bumps a generation counter so execution contexts can drop
//! functions they loaded from an older table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::script::Bytecode;

/// Immutable snapshot of a registry.
pub type FunctionTable = BTreeMap<String, Bytecode>;

/// Function registry of one node.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    table: RwLock<Arc<FunctionTable>>,
    generation: AtomicU64,
}

impl FunctionRegistry {
    /// Empty registry at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with `table`.
    pub fn from_table(table: FunctionTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            generation: AtomicU64::new(0),
        }
    }

    /// Add or overwrite one entry. Returns the new generation.
    pub fn insert(&self, name: impl Into<String>, code: Bytecode) -> u64 {
        let mut table = self.table.write();
        let mut next = (**table).clone();
        next.insert(name.into(), code);
        *table = Arc::new(next);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Replace the whole table. Returns the new generation.
    pub fn replace(&self, next: Arc<FunctionTable>) -> u64 {
        let mut table = self.table.write();
        *table = next;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current table.
    pub fn snapshot(&self) -> Arc<FunctionTable> {
        self.table.read().clone()
    }

    /// Bytecode registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Bytecode> {
        self.table.read().get(name).cloned()
    }

    /// Number of changes applied so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Content digest of the current table.
    pub fn digest(&self) -> String {
        digest(&self.snapshot())
    }
}

/// Hex blake3 digest over names and bytecode, in key order.
pub fn digest(table: &FunctionTable) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, code) in table {
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&(code.len() as u64).to_le_bytes());
        hasher.update(code.as_str().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(text: &str) -> Bytecode {
        Bytecode::from_raw(format!("\u{1b}XSC{}", text))
    }

    #[test]
    fn insert_and_lookup() {
        let registry = FunctionRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.insert("a", code("1")), 1);
        assert_eq!(registry.insert("b", code("2")), 2);
        assert_eq!(registry.lookup("a"), Some(code("1")));
        assert_eq!(registry.lookup("c"), None);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn replace_drops_old_entries() {
        let registry = FunctionRegistry::new();
        registry.insert("a", code("1"));
        registry.insert("b", code("2"));

        let mut next = FunctionTable::new();
        next.insert("c".into(), code("3"));
        registry.replace(Arc::new(next));

        assert_eq!(registry.names(), vec!["c".to_string()]);
        assert_eq!(registry.lookup("a"), None);
        assert_eq!(registry.generation(), 3);
    }

    #[test]
    fn snapshots_are_stable() {
        let registry = FunctionRegistry::new();
        registry.insert("a", code("1"));
        let before = registry.snapshot();
        registry.insert("b", code("2"));
        assert_eq!(before.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn digest_tracks_content() {
        let a = FunctionRegistry::new();
        let b = FunctionRegistry::new();
        assert_eq!(a.digest(), b.digest());

        a.insert("f", code("1"));
        assert_ne!(a.digest(), b.digest());
        b.replace(a.snapshot());
        assert_eq!(a.digest(), b.digest());

        // Boundaries between name and code are part of the digest.
        let mut left = FunctionTable::new();
        left.insert("ab".into(), Bytecode::from_raw("c"));
        let mut right = FunctionTable::new();
        right.insert("a".into(), Bytecode::from_raw("bc"));
        assert_ne!(digest(&left), digest(&right));
    }
}
