//! Ordered, grouped dependency lists.
//!
//! Builders request dependencies one at a time or in batches; the batch
//! boundaries matter because on a later dirty check every member of a group
//! may be change-checked in parallel. [`GroupedDeps`] preserves both the
//! request order and those boundaries.

use crate::nodekey::NodeKey;
use std::collections::BTreeSet;

/// An ordered list of dependency keys partitioned into groups.
///
/// Equality is ordered and grouped: two lists are equal only when they hold
/// the same keys in the same order with the same group boundaries. That is
/// the equality used by the version-suppression check on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupedDeps {
    groups: Vec<Vec<NodeKey>>,
}

impl GroupedDeps {
    pub fn new() -> Self {
        GroupedDeps::default()
    }

    /// Appends a single key as its own group.
    pub fn push(&mut self, key: NodeKey) {
        self.groups.push(vec![key]);
    }

    /// Appends a batch of keys as one group. Empty batches are dropped.
    pub fn push_group(&mut self, group: Vec<NodeKey>) {
        if !group.is_empty() {
            self.groups.push(group);
        }
    }

    /// Appends all of `other`'s groups, preserving their boundaries.
    pub fn append(&mut self, other: GroupedDeps) {
        self.groups.extend(other.groups);
    }

    pub fn group(&self, index: usize) -> Option<&[NodeKey]> {
        self.groups.get(index).map(Vec::as_slice)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn groups(&self) -> impl Iterator<Item = &[NodeKey]> {
        self.groups.iter().map(Vec::as_slice)
    }

    /// Flat iteration over every key, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeKey> {
        self.groups.iter().flatten()
    }

    /// Total number of keys across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Set view of all members.
    pub fn to_set(&self) -> BTreeSet<NodeKey> {
        self.iter().cloned().collect()
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.iter().any(|k| k == key)
    }

    /// Removes every key in `remove` from the list. Group boundaries of the
    /// survivors are unchanged; groups emptied by the removal disappear.
    pub fn remove_all(&mut self, remove: &BTreeSet<NodeKey>) {
        for group in self.groups.iter_mut() {
            group.retain(|key| !remove.contains(key));
        }
        self.groups.retain(|group| !group.is_empty());
    }
}

impl FromIterator<NodeKey> for GroupedDeps {
    fn from_iter<I: IntoIterator<Item = NodeKey>>(iter: I) -> Self {
        let mut deps = GroupedDeps::new();
        for key in iter {
            deps.push(key);
        }
        deps
    }
}
