//! [crate::nodekey] contains the key types that identify nodes in the
//! evaluation graph, plus the weak-reference interner that canonicalizes keys
//! so that equal keys requested by many builders share a single allocation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::RandomState, HashMap},
    fmt::{Display, Formatter},
    hash::BuildHasher,
    sync::{Arc, Weak},
};

/// The node-type tag of a [`NodeKey`]. Builders are registered per tag, so
/// every key with the same tag is produced by the same builder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeTag(Arc<str>);

impl NodeTag {
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        NodeTag(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeTag {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeTag {
    fn from(tag: &str) -> Self {
        NodeTag::new(tag)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
struct KeyData {
    tag: NodeTag,
    id: Arc<str>,
}

/// Identity of one node in the graph: a (type tag, identity) pair.
///
/// Keys are content-addressed (`Eq`/`Hash`/`Ord` compare contents, not
/// pointers) and cheap to clone. The evaluator canonicalizes keys through the
/// graph's [`KeyInterner`], so long-lived keys for the same node collapse to
/// one allocation; a deserialized key is structurally equal but not canonical
/// until it passes through the interner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey(Arc<KeyData>);

impl NodeKey {
    pub fn new(tag: impl Into<NodeTag>, id: impl Into<Arc<str>>) -> Self {
        NodeKey(Arc::new(KeyData {
            tag: tag.into(),
            id: id.into(),
        }))
    }

    pub fn tag(&self) -> &NodeTag {
        &self.0.tag
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &NodeKey) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.0.tag, self.0.id)
    }
}

/// Canonicalizes [`NodeKey`]s through weak references.
///
/// Holding only `Weak` handles keeps the table from retaining keys whose
/// nodes have been removed from the graph; dead slots are pruned while their
/// bucket is scanned. The interner is owned by the graph store, so its
/// lifetime is bounded by the graph's.
#[derive(Debug, Default)]
pub struct KeyInterner {
    buckets: Mutex<HashMap<u64, Vec<Weak<KeyData>>>>,
    build_hasher: RandomState,
}

impl KeyInterner {
    pub fn new() -> Self {
        KeyInterner::default()
    }

    /// Returns the canonical copy of `key`, registering it if no live equal
    /// key is interned yet.
    pub fn intern(&self, key: NodeKey) -> NodeKey {
        let hash = self.build_hasher.hash_one(&*key.0);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(hash).or_default();
        let mut found = None;
        bucket.retain(|weak| match weak.upgrade() {
            Some(data) => {
                if found.is_none() && data == key.0 {
                    found = Some(data);
                }
                true
            }
            None => false,
        });
        match found {
            Some(data) => NodeKey(data),
            None => {
                bucket.push(Arc::downgrade(&key.0));
                key
            }
        }
    }

    /// Number of interned keys still alive.
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .values()
            .flatten()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
