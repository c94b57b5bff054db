//! Graph storage: the flat arena of node entries.
//!
//! The graph owns every entry; edges are stored as key sets inside entries,
//! never as pointers, so reverse edges cannot create ownership cycles even
//! when the dependency graph has logical ones. Observers get total order
//! per key through the entry's own lock; there is no ordering between keys.

pub mod deps;
pub mod entry;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::nodekey::{KeyInterner, NodeKey};
pub use deps::GroupedDeps;
pub use entry::{CommittedValue, DependencyState, DirtyState, DirtyTransition, NodeEntry};

/// A graph version: the monotonically non-decreasing integer an evaluation
/// runs at. Each done entry remembers the version at which its value last
/// changed; comparing those decides staleness during dirty checks.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Thread-safe mapping from key to entry with create-if-absent semantics.
///
/// Owns the key interner, so interned keys live no longer than the graph
/// that canonicalized them.
#[derive(Debug, Default)]
pub struct NodeGraph {
    entries: RwLock<HashMap<NodeKey, Arc<NodeEntry>>>,
    interner: KeyInterner,
}

impl NodeGraph {
    pub fn new() -> Self {
        NodeGraph::default()
    }

    pub fn get(&self, key: &NodeKey) -> Option<Arc<NodeEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Atomically returns the entry for `key`, creating a fresh one on the
    /// first call.
    pub fn create_if_absent(&self, key: &NodeKey) -> Arc<NodeEntry> {
        let key = self.intern(key.clone());
        self.entries
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(NodeEntry::new()))
            .clone()
    }

    /// Removes the entry for `key`. Used to garbage-collect entries that
    /// never completed after an interrupted evaluation.
    pub fn remove(&self, key: &NodeKey) {
        self.entries.write().remove(key);
    }

    /// Canonicalizes `key` through the graph's interner.
    pub fn intern(&self, key: NodeKey) -> NodeKey {
        self.interner.intern(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all keys currently in the graph.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.entries.read().keys().cloned().collect()
    }
}
