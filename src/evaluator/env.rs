//! The per-invocation environment handed to builders.
//!
//! A builder interacts with the graph only through this handle: it requests
//! dep values (singly or in groups whose boundaries are preserved for later
//! parallel change-checks), learns whether anything it asked for was missing,
//! and emits events that are stored for deduplicated replay. The commit path
//! at the bottom applies a finished build to the graph and signals waiting
//! parents.

use std::collections::{BTreeMap, BTreeSet};

use super::visitor::NodeVisitor;
use super::{signal_and_enqueue, EvalContext};
use crate::builder::{EvaluationState, Value};
use crate::error::{error_transience_key, BuilderError, ErrorInfo};
use crate::event::{replay_events, BuildEvent, EventSet, EventSetBuilder, TaggedEvents};
use crate::graph::entry::{CommittedValue, DependencyState};
use crate::graph::{GroupedDeps, NodeGraph};
use crate::nodekey::NodeKey;

/// Looks `key` up in the bubbling sideband map first, then in the graph.
/// Returns the committed payload only if the node is done (or synthesized
/// during error bubbling).
pub(crate) fn value_maybe_from_error(
    graph: &NodeGraph,
    key: &NodeKey,
    bubble_error_info: Option<&BTreeMap<NodeKey, CommittedValue>>,
) -> Option<CommittedValue> {
    if let Some(bubble) = bubble_error_info {
        if let Some(committed) = bubble.get(key) {
            return Some(committed.clone());
        }
    }
    match graph.get(key) {
        Some(entry) if entry.is_done() => Some(entry.committed()),
        _ => None,
    }
}

/// The environment a [`NodeBuilder`](crate::builder::NodeBuilder) builds
/// against.
pub struct BuilderEnv<'a> {
    cx: &'a EvalContext<'a>,
    visitor: &'a NodeVisitor,
    key: NodeKey,
    /// Deps registered by previous invocations for this key; all done.
    direct_deps: BTreeSet<NodeKey>,
    /// Sideband error map during fail-fast bubbling. Builds running against
    /// it may not register new deps and never mutate the graph.
    bubble_error_info: Option<&'a BTreeMap<NodeKey, CommittedValue>>,
    newly_requested: GroupedDeps,
    newly_requested_set: BTreeSet<NodeKey>,
    open_group: Option<Vec<NodeKey>>,
    deps_missing: bool,
    child_errors: Vec<ErrorInfo>,
    events: Vec<BuildEvent>,
    value: Option<Value>,
    error: Option<ErrorInfo>,
    building: bool,
}

impl<'a> BuilderEnv<'a> {
    pub(crate) fn new(
        cx: &'a EvalContext<'a>,
        visitor: &'a NodeVisitor,
        key: NodeKey,
        direct_deps: BTreeSet<NodeKey>,
        bubble_error_info: Option<&'a BTreeMap<NodeKey, CommittedValue>>,
    ) -> Self {
        BuilderEnv {
            cx,
            visitor,
            key,
            direct_deps,
            bubble_error_info,
            newly_requested: GroupedDeps::new(),
            newly_requested_set: BTreeSet::new(),
            open_group: None,
            deps_missing: false,
            child_errors: Vec::new(),
            events: Vec::new(),
            value: None,
            error: None,
            building: true,
        }
    }

    /// The key being built.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Returns the dep's value if it is done; otherwise records the miss,
    /// registers the dep, and returns `None`. A dep done in error also
    /// yields `None` here (unless keep-going gave it a value); use
    /// [`get_dep_or_error`](Self::get_dep_or_error) to observe the error.
    pub fn get_dep(&mut self, dep: NodeKey) -> Option<Value> {
        match self.dep_value(dep, false) {
            Ok(value) => value,
            Err(_) => None,
        }
    }

    /// Like [`get_dep`](Self::get_dep), but a dep done with a builder error
    /// surfaces that error for the caller to handle. A builder that cannot
    /// handle it should propagate it with `?`. Deps failed only by cycles
    /// are still reported as missing, not as errors.
    pub fn get_dep_or_error(&mut self, dep: NodeKey) -> Result<Option<Value>, BuilderError> {
        self.dep_value(dep, true)
    }

    /// Requests a batch of deps as one group. Group boundaries are
    /// preserved, so on a later dirty check the whole group is re-checked in
    /// parallel. Duplicate keys collapse.
    pub fn get_deps(
        &mut self,
        deps: impl IntoIterator<Item = NodeKey>,
    ) -> BTreeMap<NodeKey, Option<Value>> {
        self.start_group();
        let mut result = BTreeMap::new();
        for dep in deps {
            let dep = self.cx.graph.intern(dep);
            if result.contains_key(&dep) {
                continue;
            }
            let value = match self.dep_value(dep.clone(), false) {
                Ok(value) => value,
                Err(_) => None,
            };
            result.insert(dep, value);
        }
        self.end_group();
        result
    }

    /// Group request variant surfacing per-dep builder errors, as
    /// [`get_dep_or_error`](Self::get_dep_or_error) does.
    pub fn get_deps_or_error(
        &mut self,
        deps: impl IntoIterator<Item = NodeKey>,
    ) -> BTreeMap<NodeKey, Result<Option<Value>, BuilderError>> {
        self.start_group();
        let mut result = BTreeMap::new();
        for dep in deps {
            let dep = self.cx.graph.intern(dep);
            if result.contains_key(&dep) {
                continue;
            }
            let value = self.dep_value(dep.clone(), true);
            result.insert(dep, value);
        }
        self.end_group();
        result
    }

    /// True if any requested dep was not done.
    pub fn deps_missing(&self) -> bool {
        self.deps_missing
    }

    /// Stores a warning for deduplicated replay through the reporter.
    pub fn report_warning(&mut self, message: impl Into<String>) {
        assert!(self.building, "event emitted after {} finished", self.key);
        self.events.push(BuildEvent::warning(message));
    }

    /// Stores an error event for deduplicated replay through the reporter.
    pub fn report_error(&mut self, message: impl Into<String>) {
        assert!(self.building, "event emitted after {} finished", self.key);
        self.events.push(BuildEvent::error(message));
    }

    /// Forwards a progress message to the reporter immediately. Progress is
    /// never stored for replay.
    pub fn progress(&self, message: &str) {
        assert!(self.building, "event emitted after {} finished", self.key);
        self.cx.reporter.progress(message);
    }

    fn dep_value(&mut self, dep: NodeKey, want_error: bool) -> Result<Option<Value>, BuilderError> {
        assert!(self.building, "dep requested after {} finished", self.key);
        let dep = self.cx.graph.intern(dep);
        let Some(committed) = value_maybe_from_error(self.cx.graph, &dep, self.bubble_error_info)
        else {
            self.deps_missing = true;
            if self.bubble_error_info.is_some() {
                // Nodes rebuilt just for their errors may not request new
                // children.
                return Ok(None);
            }
            assert!(
                !self.direct_deps.contains(&dep),
                "registered dep {dep} of {} is not done",
                self.key
            );
            self.add_dep(dep);
            return Ok(None);
        };

        if !self.direct_deps.contains(&dep) {
            self.add_dep(dep.clone());
        }
        replay_events(&committed.events, self.cx.reporter, self.cx.emitted);
        if let Some(error) = &committed.error {
            self.child_errors.push(error.clone());
        }
        if committed.value.is_some() && (self.cx.config.keep_going || committed.error.is_none()) {
            // The dep's value is visible if it built cleanly, or in
            // keep-going mode even when parts of its subtree failed.
            return Ok(committed.value);
        }
        let error = committed
            .error
            .expect("dep committed with neither value nor error");
        if want_error {
            if let Some(builder_error) = error.builder_error {
                return Err(builder_error);
            }
            debug_assert!(!error.cycles.is_empty());
        }
        self.deps_missing = true;
        Ok(None)
    }

    fn add_dep(&mut self, dep: NodeKey) {
        if self.newly_requested_set.insert(dep.clone()) {
            match &mut self.open_group {
                Some(group) => group.push(dep),
                None => self.newly_requested.push(dep),
            }
        }
    }

    fn start_group(&mut self) {
        debug_assert!(self.open_group.is_none());
        self.open_group = Some(Vec::new());
    }

    fn end_group(&mut self) {
        let group = self.open_group.take().expect("no open dep group");
        self.newly_requested.push_group(group);
    }

    pub(crate) fn take_newly_requested(&mut self) -> GroupedDeps {
        self.newly_requested_set.clear();
        std::mem::take(&mut self.newly_requested)
    }

    pub(crate) fn newly_requested_set(&self) -> &BTreeSet<NodeKey> {
        &self.newly_requested_set
    }

    pub(crate) fn remove_newly_requested(&mut self, remove: &BTreeSet<NodeKey>) {
        self.newly_requested.remove_all(remove);
        for key in remove {
            self.newly_requested_set.remove(key);
        }
    }

    pub(crate) fn has_child_errors(&self) -> bool {
        !self.child_errors.is_empty()
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        assert!(
            self.error.is_none() && self.bubble_error_info.is_none(),
            "value set for {} while in error",
            self.key
        );
        assert!(self.value.is_none(), "value already set for {}", self.key);
        self.value = Some(value);
    }

    /// Puts the build in error. A transient error registers the implicit dep
    /// on the error-transience key, which must always be the last dep.
    pub(crate) fn set_error(&mut self, error: ErrorInfo) {
        assert!(self.value.is_none(), "error set for {} after a value", self.key);
        assert!(self.error.is_none(), "error already set for {}", self.key);
        if error.is_transient {
            let transience = error_transience_key();
            let dep_entry = self
                .cx
                .graph
                .get(transience)
                .expect("error-transience entry exists during evaluation");
            let state = dep_entry.add_reverse_dep_and_check_if_done(Some(&self.key));
            assert_eq!(
                state,
                DependencyState::Done,
                "error-transience entry is not done"
            );
            let entry = self
                .cx
                .graph
                .get(&self.key)
                .expect("entry being built exists");
            let mut group = GroupedDeps::new();
            group.push(transience.clone());
            entry.add_temporary_direct_deps(group);
            entry.signal_dep(None);
        }
        self.error = Some(error);
    }

    /// If the builder did not set its own error but children failed, the
    /// node's error becomes the union of the child errors.
    fn finalize_error_info(&mut self) {
        if self.error.is_none() && !self.child_errors.is_empty() {
            self.error = Some(ErrorInfo::from_children(std::mem::take(
                &mut self.child_errors,
            )));
        }
    }

    /// Aggregates this build's direct events with the event sets of every
    /// registered dep, by reference.
    pub(crate) fn build_events(&self, missing_children: bool) -> EventSet {
        let mut builder = EventSetBuilder::new();
        if !self.events.is_empty() {
            builder.add(TaggedEvents {
                tag: self.event_tag(),
                events: self.events.clone(),
            });
        }
        let entry = self
            .cx
            .graph
            .get(&self.key)
            .expect("entry being built exists");
        for dep in entry.temporary_direct_deps() {
            match value_maybe_from_error(self.cx.graph, &dep, self.bubble_error_info) {
                Some(committed) => builder.add_transitive(committed.events),
                None => assert!(
                    missing_children,
                    "dep {dep} of {} is unexpectedly unfinished",
                    self.key
                ),
            }
        }
        builder.build()
    }

    fn event_tag(&self) -> Option<String> {
        self.cx
            .builders
            .get(self.key.tag())
            .and_then(|builder| builder.event_tag(&self.key))
    }

    /// Applies the finished build to the graph and signals every parent
    /// waiting on this node.
    ///
    /// Parents are enqueued unless this node is committed after the main
    /// evaluation aborted (error bubbling, cycle synthesis) or committed in
    /// error on a fail-fast evaluation that is about to shut down. Reverse
    /// deps are collected from the entry itself at commit time, so parents
    /// that registered concurrently are signaled too; parents registering
    /// after the snapshot observe the done entry and signal themselves.
    pub(crate) fn commit(&mut self, enqueue_parents: bool) {
        let entry = self
            .cx
            .graph
            .get(&self.key)
            .expect("entry being committed exists");
        self.finalize_error_info();
        let events = self.build_events(false);

        if self.value.is_none() {
            let error = self.error.clone();
            assert!(
                error.is_some(),
                "commit of {} with neither value nor error",
                self.key
            );
            let reverse_deps = entry.set_value(None, error, events.clone(), self.cx.version);
            signal_and_enqueue(
                self.cx.graph,
                enqueue_parents.then_some(self.visitor),
                &reverse_deps,
                self.cx.version,
            );
        } else {
            assert!(enqueue_parents, "value commits always enqueue parents");
            let reverse_deps = entry.set_value(
                self.value.clone(),
                self.error.clone(),
                events.clone(),
                self.cx.version,
            );
            // If the rebuild produced an equal value, the entry preserved
            // its old version and parents see no change.
            let node_version = entry.version();
            if let Some(progress) = self.cx.progress {
                let state = if node_version < self.cx.version {
                    EvaluationState::Clean
                } else {
                    EvaluationState::Built
                };
                progress.evaluated(&self.key, self.value.as_ref(), state);
            }
            signal_and_enqueue(
                self.cx.graph,
                Some(self.visitor),
                &reverse_deps,
                node_version,
            );
        }

        self.visitor.notify_done(&self.key);
        replay_events(&events, self.cx.reporter, self.cx.emitted);
        self.building = false;
    }
}
