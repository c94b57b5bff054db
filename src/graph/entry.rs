//! Per-node entry state machine.
//!
//! An entry's life is a small FSM: `Fresh -> Evaluating -> Done ->
//! Evaluating(dirty) -> Done -> ...`. The done payload lives only in the
//! [`EntryState::Done`] variant, so an evaluating entry structurally cannot
//! carry a committed value. All operations lock the entry; the graph never
//! locks across entries.

use parking_lot::Mutex;
use std::collections::BTreeSet;

use super::deps::GroupedDeps;
use super::Version;
use crate::builder::Value;
use crate::error::{error_transience_key, ErrorInfo};
use crate::event::EventSet;
use crate::nodekey::NodeKey;

/// Result of registering a reverse dependency on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// The entry is done; the caller should signal itself with the entry's
    /// version.
    Done,
    /// The entry is already evaluating; the caller will be signaled when it
    /// finishes.
    AddedDep,
    /// The caller drove the Fresh -> Evaluating transition and must schedule
    /// the entry. Returned exactly once per evaluating cycle.
    NeedsScheduling,
}

/// Sub-state of a previously done entry that has been marked dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Previous deps must be re-checked, group by group, before deciding
    /// whether a rebuild is needed.
    CheckDependencies,
    /// Every previous dep signaled with an unchanged version; the old value
    /// is still valid.
    VerifiedClean,
    /// The node itself changed, or some dep did; a full rebuild is required
    /// (or in progress).
    Rebuilding,
}

/// A done entry's committed payload plus its aggregated events.
#[derive(Debug, Clone)]
pub struct CommittedValue {
    pub value: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub events: EventSet,
}

/// Data captured when a done entry is dirtied, returned to the caller so it
/// can sever the now-stale reverse edges and continue the dirty walk.
#[derive(Debug)]
pub struct DirtyTransition {
    /// Reverse deps at the moment of dirtying; these are the parents the
    /// dirty walk continues through.
    pub reverse_deps: BTreeSet<NodeKey>,
    /// The entry's previous direct deps; the caller removes the entry from
    /// each one's reverse-dep set. Edges are re-registered one group at a
    /// time as the dirty check proceeds.
    pub last_build_deps: Vec<NodeKey>,
}

#[derive(Debug)]
struct DoneData {
    value: Option<Value>,
    error: Option<ErrorInfo>,
    events: EventSet,
    version: Version,
    direct_deps: GroupedDeps,
}

#[derive(Debug)]
struct DirtyData {
    state: DirtyState,
    last_build: DoneData,
    /// Next unchecked group of `last_build.direct_deps`; `None` once every
    /// group has been handed out, so the final signal can conclude
    /// `VerifiedClean`.
    next_group: Option<usize>,
}

#[derive(Debug, Default)]
struct BuildingState {
    /// Latched by the first `add_reverse_dep_and_check_if_done` of a cycle.
    evaluating: bool,
    signaled_deps: usize,
    direct_deps: GroupedDeps,
    dirty: Option<DirtyData>,
}

#[derive(Debug)]
enum EntryState {
    Building(BuildingState),
    Done(DoneData),
}

#[derive(Debug)]
struct EntryInner {
    reverse_deps: BTreeSet<NodeKey>,
    state: EntryState,
}

/// One node's graph state. Created by
/// [`NodeGraph::create_if_absent`](super::NodeGraph::create_if_absent).
#[derive(Debug)]
pub struct NodeEntry {
    inner: Mutex<EntryInner>,
}

impl Default for NodeEntry {
    fn default() -> Self {
        NodeEntry::new()
    }
}

impl NodeEntry {
    pub fn new() -> Self {
        NodeEntry {
            inner: Mutex::new(EntryInner {
                reverse_deps: BTreeSet::new(),
                state: EntryState::Building(BuildingState::default()),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.inner.lock().state, EntryState::Done(_))
    }

    /// Whether every registered dep has signaled. Only meaningful while the
    /// entry is building.
    pub fn is_ready(&self) -> bool {
        let inner = self.inner.lock();
        let EntryState::Building(b) = &inner.state else {
            panic!("is_ready on a done entry");
        };
        debug_assert!(b.signaled_deps <= b.direct_deps.len());
        b.signaled_deps == b.direct_deps.len()
    }

    pub fn is_dirty(&self) -> bool {
        match &self.inner.lock().state {
            EntryState::Building(b) => b.dirty.is_some(),
            EntryState::Done(_) => false,
        }
    }

    pub fn dirty_state(&self) -> Option<DirtyState> {
        match &self.inner.lock().state {
            EntryState::Building(b) => b.dirty.as_ref().map(|d| d.state),
            EntryState::Done(_) => None,
        }
    }

    /// Idempotent registration of `parent` as a reverse dep. `None` is used
    /// when seeding requested roots.
    pub fn add_reverse_dep_and_check_if_done(&self, parent: Option<&NodeKey>) -> DependencyState {
        let mut inner = self.inner.lock();
        if let Some(parent) = parent {
            inner.reverse_deps.insert(parent.clone());
        }
        match &mut inner.state {
            EntryState::Done(_) => DependencyState::Done,
            EntryState::Building(b) => {
                if b.evaluating {
                    DependencyState::AddedDep
                } else {
                    b.evaluating = true;
                    DependencyState::NeedsScheduling
                }
            }
        }
    }

    /// A dep finished; bump the signal counter and return whether the entry
    /// is now ready.
    ///
    /// `child_version` is the dep's version, or `None` to conservatively
    /// assume the child changed (used when repairing state during error
    /// bubbling and cycle cleanup). While dirty-checking, a changed child
    /// moves the entry to `Rebuilding`; an unchanged final signal after the
    /// last group concludes `VerifiedClean`.
    pub fn signal_dep(&self, child_version: Option<Version>) -> bool {
        let mut inner = self.inner.lock();
        let EntryState::Building(b) = &mut inner.state else {
            panic!("signal_dep on a done entry");
        };
        b.signaled_deps += 1;
        assert!(
            b.signaled_deps <= b.direct_deps.len(),
            "signaled {} deps but only {} are registered",
            b.signaled_deps,
            b.direct_deps.len()
        );
        let ready = b.signaled_deps == b.direct_deps.len();
        if let Some(d) = &mut b.dirty {
            if d.state != DirtyState::Rebuilding {
                let child_changed = child_version.map_or(true, |v| v > d.last_build.version);
                if child_changed {
                    d.state = DirtyState::Rebuilding;
                } else if d.state == DirtyState::CheckDependencies
                    && ready
                    && d.next_group.is_none()
                {
                    d.state = DirtyState::VerifiedClean;
                }
            }
        }
        ready
    }

    /// Returns the next unchecked group of the previous build's deps and
    /// registers it as temporary deps. Clears the cursor after the last
    /// group.
    pub fn get_next_dirty_direct_deps(&self) -> Vec<NodeKey> {
        let mut inner = self.inner.lock();
        let EntryState::Building(b) = &mut inner.state else {
            panic!("get_next_dirty_direct_deps on a done entry");
        };
        assert!(b.evaluating, "entry is not being evaluated");
        let d = b.dirty.as_mut().expect("entry is not dirty");
        assert_eq!(
            d.state,
            DirtyState::CheckDependencies,
            "dirty deps requested outside of dependency checking"
        );
        let index = d.next_group.expect("dirty group cursor is exhausted");
        let group: Vec<NodeKey> = d
            .last_build
            .direct_deps
            .group(index)
            .expect("dirty group cursor out of range")
            .to_vec();
        d.next_group = if index + 1 < d.last_build.direct_deps.group_count() {
            Some(index + 1)
        } else {
            None
        };
        b.direct_deps.push_group(group.clone());
        group
    }

    /// Appends newly discovered deps (with group boundaries) to the build in
    /// progress.
    pub fn add_temporary_direct_deps(&self, deps: GroupedDeps) {
        let mut inner = self.inner.lock();
        let EntryState::Building(b) = &mut inner.state else {
            panic!("add_temporary_direct_deps on a done entry");
        };
        b.direct_deps.append(deps);
    }

    /// Set view of the deps registered so far in the current build.
    pub fn temporary_direct_deps(&self) -> BTreeSet<NodeKey> {
        let inner = self.inner.lock();
        let EntryState::Building(b) = &inner.state else {
            panic!("temporary_direct_deps on a done entry");
        };
        b.direct_deps.to_set()
    }

    /// Prunes deps that never finished from the build in progress, restoring
    /// the ready invariant after a cycle was cut or an evaluation aborted.
    pub fn remove_unfinished_deps(&self, unfinished: &BTreeSet<NodeKey>) {
        let mut inner = self.inner.lock();
        let EntryState::Building(b) = &mut inner.state else {
            panic!("remove_unfinished_deps on a done entry");
        };
        b.direct_deps.remove_all(unfinished);
    }

    /// Commits the build: transitions to done and returns the reverse deps
    /// to signal.
    ///
    /// If this was a dirty rebuild whose value equals the previous one and
    /// whose dep list is group-equal to the previous build's, the previous
    /// version is preserved, so the change does not propagate to parents. A
    /// structurally different dep list advances the version even when the
    /// value is equal.
    pub fn set_value(
        &self,
        value: Option<Value>,
        error: Option<ErrorInfo>,
        events: EventSet,
        graph_version: Version,
    ) -> BTreeSet<NodeKey> {
        let mut inner = self.inner.lock();
        let state = std::mem::replace(
            &mut inner.state,
            EntryState::Building(BuildingState::default()),
        );
        let EntryState::Building(b) = state else {
            panic!("set_value on a done entry");
        };
        assert!(b.evaluating, "set_value before evaluation started");
        assert!(
            b.signaled_deps == b.direct_deps.len(),
            "set_value on an entry that is not ready"
        );
        let version = match &b.dirty {
            Some(d) => {
                assert_eq!(d.state, DirtyState::Rebuilding, "set_value outside rebuild");
                if Self::unchanged_from_last_build(d, &b.direct_deps, &value, &error) {
                    d.last_build.version
                } else {
                    graph_version
                }
            }
            None => graph_version,
        };
        inner.state = EntryState::Done(DoneData {
            value,
            error,
            events,
            version,
            direct_deps: b.direct_deps,
        });
        inner.reverse_deps.clone()
    }

    fn unchanged_from_last_build(
        dirty: &DirtyData,
        new_deps: &GroupedDeps,
        value: &Option<Value>,
        error: &Option<ErrorInfo>,
    ) -> bool {
        let values_equal = match (&dirty.last_build.value, value) {
            (Some(old), Some(new)) => old.eq_value(&**new),
            _ => false,
        };
        values_equal
            && error.is_none()
            && dirty.last_build.error.is_none()
            && dirty.last_build.direct_deps == *new_deps
    }

    /// Finalizes a `VerifiedClean` dirty check: restores the previous value
    /// without rebuilding. The version is unchanged. Returns the reverse
    /// deps to signal.
    pub fn mark_clean(&self) -> BTreeSet<NodeKey> {
        let mut inner = self.inner.lock();
        let state = std::mem::replace(
            &mut inner.state,
            EntryState::Building(BuildingState::default()),
        );
        let EntryState::Building(mut b) = state else {
            panic!("mark_clean on a done entry");
        };
        assert!(b.evaluating, "mark_clean before evaluation started");
        let d = b.dirty.take().expect("mark_clean on a non-dirty entry");
        assert_eq!(d.state, DirtyState::VerifiedClean);
        inner.state = EntryState::Done(d.last_build);
        inner.reverse_deps.clone()
    }

    /// Done -> Evaluating(dirty). Captures the previous build for change
    /// comparison and returns what the caller needs to continue the dirty
    /// walk, or `None` if the entry was not done (already dirty, fresh, or
    /// mid-build).
    ///
    /// A depless entry can only be dirtied as changed: with no deps nothing
    /// could have dirtied it. An entry whose previous deps include the
    /// error-transience key goes straight to `Rebuilding` (transient errors
    /// are always retried, never change-pruned).
    pub fn mark_dirty(&self, is_changed: bool) -> Option<DirtyTransition> {
        let mut inner = self.inner.lock();
        if let EntryState::Building(b) = &mut inner.state {
            // Upgrading an unchanged-dirty entry to changed is legal as long
            // as its evaluation has not started.
            if is_changed && !b.evaluating {
                if let Some(d) = &mut b.dirty {
                    if d.state == DirtyState::CheckDependencies {
                        d.state = DirtyState::Rebuilding;
                        d.next_group = None;
                    }
                }
            }
            return None;
        }
        let state = std::mem::replace(
            &mut inner.state,
            EntryState::Building(BuildingState::default()),
        );
        let EntryState::Done(data) = state else {
            unreachable!();
        };
        assert!(
            is_changed || !data.direct_deps.is_empty(),
            "marked dirty but not changed, with no deps that could have dirtied it"
        );
        let rebuild = is_changed || data.direct_deps.contains(error_transience_key());
        let last_build_deps: Vec<NodeKey> = data.direct_deps.iter().cloned().collect();
        inner.state = EntryState::Building(BuildingState {
            evaluating: false,
            signaled_deps: 0,
            direct_deps: GroupedDeps::new(),
            dirty: Some(DirtyData {
                state: if rebuild {
                    DirtyState::Rebuilding
                } else {
                    DirtyState::CheckDependencies
                },
                next_group: if rebuild { None } else { Some(0) },
                last_build: data,
            }),
        });
        Some(DirtyTransition {
            reverse_deps: inner.reverse_deps.clone(),
            last_build_deps,
        })
    }

    pub fn remove_reverse_dep(&self, key: &NodeKey) {
        self.inner.lock().reverse_deps.remove(key);
    }

    /// Snapshot of the reverse deps, in any state.
    pub fn reverse_deps(&self) -> BTreeSet<NodeKey> {
        self.inner.lock().reverse_deps.clone()
    }

    /// The version at which the committed value last changed.
    pub fn version(&self) -> Version {
        match &self.inner.lock().state {
            EntryState::Done(data) => data.version,
            EntryState::Building(_) => panic!("version of an entry that is not done"),
        }
    }

    pub fn value(&self) -> Option<Value> {
        match &self.inner.lock().state {
            EntryState::Done(data) => data.value.clone(),
            EntryState::Building(_) => panic!("value of an entry that is not done"),
        }
    }

    pub fn error_info(&self) -> Option<ErrorInfo> {
        match &self.inner.lock().state {
            EntryState::Done(data) => data.error.clone(),
            EntryState::Building(_) => panic!("error_info of an entry that is not done"),
        }
    }

    /// The committed payload with its aggregated events.
    pub fn committed(&self) -> CommittedValue {
        match &self.inner.lock().state {
            EntryState::Done(data) => CommittedValue {
                value: data.value.clone(),
                error: data.error.clone(),
                events: data.events.clone(),
            },
            EntryState::Building(_) => panic!("committed payload of an entry that is not done"),
        }
    }

    /// The final, immutable dep list of a done entry.
    pub fn finished_direct_deps(&self) -> GroupedDeps {
        match &self.inner.lock().state {
            EntryState::Done(data) => data.direct_deps.clone(),
            EntryState::Building(_) => panic!("finished deps of an entry that is not done"),
        }
    }
}
