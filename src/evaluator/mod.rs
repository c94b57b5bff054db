//! The evaluation driver.
//!
//! [`Evaluator`] owns the persistent graph and the builder registry. Each
//! [`eval`](Evaluator::eval) call walks the requested roots' transitive
//! deps on a bounded worker pool, memoizing every node it completes; later
//! calls re-use everything whose inputs did not change. Invalidation marks
//! done entries dirty and lets the next evaluation change-prune them.

pub mod env;

mod cycles;
mod visitor;

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::builder::{BuilderRegistry, EvaluationState, ProgressReceiver};
use crate::config::EvalConfig;
use crate::error::{error_transience_key, ErrorInfo, ErrorTransience, EvalError};
use crate::event::{EmittedEventState, EventReporter, EventSet, TracingReporter};
use crate::graph::entry::{CommittedValue, DependencyState, DirtyState, NodeEntry};
use crate::graph::{NodeGraph, Version};
use crate::nodekey::NodeKey;
use crate::result::EvalResult;
use env::{value_maybe_from_error, BuilderEnv};
use visitor::{EvalAbort, Halt, NodeVisitor, SchedulerError};

/// Cooperative cancellation handle for an [`Evaluator`].
///
/// Workers observe the interrupt at builder boundaries; the running
/// [`eval`](Evaluator::eval) cleans partially evaluated nodes out of the
/// graph and returns [`EvalError::Interrupted`].
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-evaluation shared context handed down to environments and the cycle
/// detector.
pub(crate) struct EvalContext<'a> {
    pub graph: &'a NodeGraph,
    pub builders: &'a BuilderRegistry,
    pub config: &'a EvalConfig,
    pub version: Version,
    pub reporter: &'a dyn EventReporter,
    pub emitted: &'a EmittedEventState,
    pub progress: Option<&'a dyn ProgressReceiver>,
}

/// Parallel incremental evaluator over a persistent node graph.
pub struct Evaluator {
    graph: NodeGraph,
    builders: BuilderRegistry,
    config: EvalConfig,
    reporter: Arc<dyn EventReporter>,
    progress: Option<Arc<dyn ProgressReceiver>>,
    emitted: EmittedEventState,
    interrupt: Arc<AtomicBool>,
    last_version: Mutex<Option<Version>>,
}

impl Evaluator {
    pub fn new(builders: BuilderRegistry, config: EvalConfig) -> Self {
        Evaluator {
            graph: NodeGraph::new(),
            builders,
            config,
            reporter: Arc::new(TracingReporter),
            progress: None,
            emitted: EmittedEventState::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            last_version: Mutex::new(None),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn EventReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReceiver>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: self.interrupt.clone(),
        }
    }

    /// Read access to the underlying graph, for inspection and tests.
    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    /// Evaluates `roots` at `version`, returning each root's value or error.
    ///
    /// May be called repeatedly on the same graph with non-decreasing
    /// versions; nodes whose transitive inputs did not change are re-used
    /// without invoking their builders.
    pub fn eval(&self, roots: &[NodeKey], version: Version) -> Result<EvalResult, EvalError> {
        {
            let mut last = self.last_version.lock();
            if let Some(last) = *last {
                assert!(
                    version >= last,
                    "graph version must be non-decreasing: {version} after {last}"
                );
            }
            *last = Some(version);
        }
        self.interrupt.store(false, Ordering::Relaxed);

        let mut seen = BTreeSet::new();
        let roots: Vec<NodeKey> = roots
            .iter()
            .map(|key| self.graph.intern(key.clone()))
            .filter(|key| seen.insert(key.clone()))
            .collect();

        let cx = EvalContext {
            graph: &self.graph,
            builders: &self.builders,
            config: &self.config,
            version,
            reporter: &*self.reporter,
            emitted: &self.emitted,
            progress: self.progress.as_deref(),
        };

        // Re-stamping the transience key first dirties any node holding a
        // transient error, so such roots never take the fast path below.
        self.ensure_error_transience(version);

        // If every requested root is already done and clean, skip the pool.
        if roots
            .iter()
            .all(|key| self.graph.get(key).is_some_and(|entry| entry.is_done()))
        {
            tracing::debug!(
                "[evaluator] all {} roots already done at {version}",
                roots.len()
            );
            return Ok(construct_result(&cx, None, &roots, None));
        }

        let visitor = NodeVisitor::new(self.interrupt.clone(), self.progress.clone());
        for root in &roots {
            let entry = self.graph.create_if_absent(root);
            // Must mirror the child-enqueue protocol to be thread-safe.
            match entry.add_reverse_dep_and_check_if_done(None) {
                DependencyState::NeedsScheduling => visitor.enqueue_evaluation(root),
                DependencyState::Done => {
                    if let Some(progress) = cx.progress {
                        if let Some(value) = entry.value() {
                            let state = if entry.version() < version {
                                EvaluationState::Clean
                            } else {
                                EvaluationState::Built
                            };
                            progress.evaluated(root, Some(&value), state);
                        }
                    }
                }
                DependencyState::AddedDep => {}
            }
        }

        tracing::debug!(
            "[evaluator] evaluating {} roots at {version} with {} workers",
            roots.len(),
            self.config.thread_count
        );
        let halt = visitor.run(self.config.thread_count, |key| {
            self.evaluate(&cx, &visitor, key)
        });

        let result = match halt {
            None => Ok(construct_result(&cx, Some(&visitor), &roots, None)),
            Some(Halt::Error(scheduler_error)) if !visitor.interrupted() => {
                tracing::debug!(
                    "[evaluator] bubbling error from {} to a requested root",
                    scheduler_error.key
                );
                let bubbled = self.bubble_error_up(&cx, &visitor, scheduler_error, &roots);
                Ok(construct_result(&cx, Some(&visitor), &roots, bubbled))
            }
            Some(Halt::Error(_)) | Some(Halt::Interrupted) => Err(EvalError::Interrupted),
            Some(Halt::Panic(payload)) => {
                visitor.clean(&self.graph);
                std::panic::resume_unwind(payload);
            }
        };
        visitor.clean(&self.graph);
        result
    }

    /// Marks done entries dirty. `is_changed` forces a rebuild; otherwise
    /// the next evaluation change-checks their deps group by group.
    /// Dirtiness propagates transitively to every done ancestor.
    pub fn invalidate(&self, keys: &[NodeKey], is_changed: bool) {
        let keys: Vec<NodeKey> = keys
            .iter()
            .map(|key| self.graph.intern(key.clone()))
            .collect();
        self.mark_dirty_transitive(&keys, is_changed);
    }

    fn mark_dirty_transitive(&self, seeds: &[NodeKey], is_changed: bool) {
        let mut stack: Vec<(NodeKey, bool)> = seeds
            .iter()
            .map(|key| (key.clone(), is_changed))
            .collect();
        while let Some((key, changed)) = stack.pop() {
            let Some(entry) = self.graph.get(&key) else {
                tracing::debug!("[invalidate] {key} is not in the graph, skipping");
                continue;
            };
            let Some(transition) = entry.mark_dirty(changed) else {
                // Already dirty or never finished; ancestors were handled
                // when it was first dirtied.
                continue;
            };
            tracing::debug!("[invalidate] dirtied {key} (changed: {changed})");
            // Sever the now-stale reverse edges; the dirty check re-registers
            // them one group at a time.
            for dep in &transition.last_build_deps {
                if let Some(dep_entry) = self.graph.get(dep) {
                    dep_entry.remove_reverse_dep(&key);
                }
            }
            for parent in transition.reverse_deps {
                stack.push((parent, false));
            }
        }
    }

    /// Creates the error-transience entry if needed and re-stamps it at
    /// `version`, dirtying every node holding a transient error so it is
    /// re-built this evaluation.
    fn ensure_error_transience(&self, version: Version) {
        let key = error_transience_key();
        let entry = self.graph.create_if_absent(key);
        if entry.is_done() {
            self.mark_dirty_transitive(std::slice::from_ref(key), true);
        }
        match entry.add_reverse_dep_and_check_if_done(None) {
            DependencyState::NeedsScheduling => {
                let marker: crate::builder::Value = Arc::new(ErrorTransience);
                entry.set_value(Some(marker), None, EventSet::empty(), version);
            }
            DependencyState::Done => {}
            DependencyState::AddedDep => {
                panic!("error-transience entry left mid-evaluation")
            }
        }
    }

    /// Evaluates one ready key: advance its dirty check, or run its builder
    /// and commit one of the four outcomes.
    fn evaluate(
        &self,
        cx: &EvalContext<'_>,
        visitor: &NodeVisitor,
        key: NodeKey,
    ) -> Result<(), EvalAbort> {
        if visitor.interrupted() {
            return Err(EvalAbort::Interrupted);
        }
        let entry = self.graph.get(&key).expect("scheduled entry in graph");
        assert!(entry.is_ready(), "{key} scheduled while not ready");

        if let Some(dirty_state) = entry.dirty_state() {
            match dirty_state {
                DirtyState::CheckDependencies => {
                    // Check children group by group: if an earlier group
                    // changed, this node rebuilds from scratch and the later
                    // groups (which may no longer be deps at all) are never
                    // touched. Members of one group are checked in parallel.
                    for child in entry.get_next_dirty_direct_deps() {
                        self.enqueue_child(cx, visitor, &key, &entry, child);
                    }
                    return Ok(());
                }
                DirtyState::VerifiedClean => {
                    visitor.notify_done(&key);
                    let reverse_deps = entry.mark_clean();
                    tracing::debug!("[evaluator] {key} verified clean");
                    if let Some(progress) = cx.progress {
                        progress.evaluated(&key, entry.value().as_ref(), EvaluationState::Clean);
                    }
                    signal_and_enqueue(
                        cx.graph,
                        Some(visitor),
                        &reverse_deps,
                        entry.version(),
                    );
                    return Ok(());
                }
                DirtyState::Rebuilding => {}
            }
        }

        let direct_deps = entry.temporary_direct_deps();
        assert!(
            !direct_deps.contains(error_transience_key()),
            "{key} depends on the error-transience key during building"
        );
        let builder = self
            .builders
            .get(key.tag())
            .unwrap_or_else(|| panic!("no builder registered for tag '{}'", key.tag()))
            .clone();

        let mut builder_env = BuilderEnv::new(cx, visitor, key.clone(), direct_deps, None);
        let build_result = builder.build(&key, &mut builder_env);
        if visitor.interrupted() {
            return Err(EvalAbort::Interrupted);
        }

        match build_result {
            Err(builder_error) => {
                tracing::debug!("[evaluator] builder for {key} failed: {builder_error}");
                self.register_newly_discovered_deps_for_done_entry(
                    cx,
                    &key,
                    &entry,
                    &mut builder_env,
                );
                let error = ErrorInfo::from_builder_error(&key, builder_error);
                builder_env.set_error(error.clone());
                builder_env.commit(cx.config.keep_going);
                if cx.config.keep_going {
                    return Ok(());
                }
                Err(EvalAbort::Scheduler(SchedulerError { key, error }))
            }
            Ok(Some(value)) => {
                assert!(
                    !builder_env.deps_missing(),
                    "{key} returned a value with deps still missing"
                );
                builder_env.set_value(value);
                self.register_newly_discovered_deps_for_done_entry(
                    cx,
                    &key,
                    &entry,
                    &mut builder_env,
                );
                builder_env.commit(true);
                Ok(())
            }
            Ok(None) => {
                let new_deps = builder_env.take_newly_requested();
                entry.add_temporary_direct_deps(new_deps.clone());
                if new_deps.is_empty() {
                    // Nothing new was requested, so a previously requested
                    // dep must be in error; commit the collected errors.
                    assert!(
                        builder_env.has_child_errors(),
                        "{key} returned no value and requested no new deps"
                    );
                    builder_env.commit(cx.config.keep_going);
                    if !cx.config.keep_going {
                        let error = entry.error_info().expect("error just committed");
                        return Err(EvalAbort::Scheduler(SchedulerError { key, error }));
                    }
                    return Ok(());
                }
                for child in new_deps.iter() {
                    self.enqueue_child(cx, visitor, &key, &entry, child.clone());
                }
                // Re-entry of this node is driven solely by the last child's
                // signal; nothing may run after the enqueue loop.
                Ok(())
            }
        }
    }

    /// The only legal way to introduce a dep edge. The tri-state result of
    /// registration decides who gets scheduled, which is what rules out lost
    /// wake-ups and double scheduling.
    fn enqueue_child(
        &self,
        cx: &EvalContext<'_>,
        visitor: &NodeVisitor,
        parent: &NodeKey,
        parent_entry: &NodeEntry,
        child: NodeKey,
    ) {
        assert!(!parent_entry.is_done(), "{parent} is done but requested {child}");
        assert_ne!(
            &child,
            error_transience_key(),
            "{parent} may not request the error-transience key"
        );
        let child_entry = cx.graph.create_if_absent(&child);
        match child_entry.add_reverse_dep_and_check_if_done(Some(parent)) {
            DependencyState::Done => {
                if parent_entry.signal_dep(Some(child_entry.version())) {
                    // Only the very last child can make the parent ready, so
                    // the parent is no longer running anywhere.
                    visitor.enqueue_evaluation(parent);
                }
            }
            DependencyState::AddedDep => {}
            DependencyState::NeedsScheduling => visitor.enqueue_evaluation(&child),
        }
    }

    /// Registers deps a builder requested before finishing with a value or
    /// error. Unfinished requests are discarded; the rest must already be
    /// done, so the entry stays ready.
    fn register_newly_discovered_deps_for_done_entry(
        &self,
        cx: &EvalContext<'_>,
        key: &NodeKey,
        entry: &NodeEntry,
        builder_env: &mut BuilderEnv<'_>,
    ) {
        let unfinished: BTreeSet<NodeKey> = builder_env
            .newly_requested_set()
            .iter()
            .filter(|dep| {
                !cx.graph
                    .get(dep)
                    .is_some_and(|dep_entry| dep_entry.is_done())
            })
            .cloned()
            .collect();
        builder_env.remove_newly_requested(&unfinished);
        let new_deps = builder_env.take_newly_requested();
        entry.add_temporary_direct_deps(new_deps.clone());
        for dep in new_deps.iter() {
            let dep_entry = cx.graph.get(dep).expect("done dep in graph");
            let state = dep_entry.add_reverse_dep_and_check_if_done(Some(key));
            assert_eq!(
                state,
                DependencyState::Done,
                "new dep {dep} of {key} is not done"
            );
            entry.signal_dep(None);
        }
        assert!(entry.is_ready(), "{key} not ready after registering new deps");
    }

    /// Walks reverse edges from the failed key up to a requested root,
    /// re-running each in-flight parent once against a sideband error map so
    /// it can translate the child failure into a more specific error. The
    /// graph itself is never mutated. Returns `None` when the walk revisits
    /// a parent, which means a cycle; cycle detection handles it instead.
    fn bubble_error_up(
        &self,
        cx: &EvalContext<'_>,
        visitor: &NodeVisitor,
        leaf: SchedulerError,
        roots: &[NodeKey],
    ) -> Option<BTreeMap<NodeKey, CommittedValue>> {
        let root_set: BTreeSet<&NodeKey> = roots.iter().collect();
        let mut error = leaf.error;
        let mut error_key = leaf.key;
        let mut bubbled: BTreeMap<NodeKey, CommittedValue> = BTreeMap::new();

        while !root_set.contains(&error_key) {
            let entry = cx.graph.get(&error_key).expect("failed entry in graph");
            let reverse_deps = entry.reverse_deps();
            let parent = reverse_deps
                .first()
                .unwrap_or_else(|| panic!("{error_key} failed but has no parents"))
                .clone();
            if bubbled.contains_key(&parent) {
                return None;
            }
            let parent_entry = cx.graph.get(&parent).expect("parent entry in graph");
            if parent_entry.is_done() {
                // The failing child signaled this parent before the halt and
                // the parent finished with the error already recorded; keep
                // walking from it.
                error = parent_entry
                    .error_info()
                    .unwrap_or_else(|| panic!("{parent} done without error above {error_key}"));
                error_key = parent;
                continue;
            }
            assert!(visitor.is_inflight(&parent), "{parent} not in flight");
            error_key = parent.clone();
            if let Some(dirty_state) = parent_entry.dirty_state() {
                match dirty_state {
                    DirtyState::CheckDependencies => {
                        // The bubbled-to child never signaled; account for it
                        // and rebuild.
                        parent_entry.signal_dep(None);
                    }
                    DirtyState::Rebuilding => {}
                    DirtyState::VerifiedClean => {
                        panic!("{parent} verified clean while its child failed")
                    }
                }
            }
            let builder = self
                .builders
                .get(parent.tag())
                .unwrap_or_else(|| panic!("no builder registered for tag '{}'", parent.tag()))
                .clone();
            let mut builder_env = BuilderEnv::new(
                cx,
                visitor,
                parent.clone(),
                parent_entry.temporary_direct_deps(),
                Some(&bubbled),
            );
            // Only run to give the parent a chance at a better error; any
            // value it produces is discarded.
            let build_result = builder.build(&parent, &mut builder_env);
            let events = builder_env.build_events(true);
            drop(builder_env);
            if let Err(builder_error) = build_result {
                error = ErrorInfo::from_builder_error(&parent, builder_error);
            }
            bubbled.insert(
                parent,
                CommittedValue {
                    value: None,
                    error: Some(ErrorInfo::from_children(vec![error.clone()])),
                    events,
                },
            );
        }
        Some(bubbled)
    }
}

/// Signals `keys` that a child committed at `version`, enqueueing any parent
/// the signal made ready. With no visitor (commits after the main evaluation
/// aborted), already-done parents are skipped: cycles can leave them behind.
pub(crate) fn signal_and_enqueue(
    graph: &NodeGraph,
    visitor: Option<&NodeVisitor>,
    keys: &BTreeSet<NodeKey>,
    version: Version,
) {
    match visitor {
        Some(visitor) => {
            for key in keys {
                let entry = graph.get(key).expect("signaled parent in graph");
                if entry.signal_dep(Some(version)) {
                    visitor.enqueue_evaluation(key);
                }
            }
        }
        None => {
            for key in keys {
                let entry = graph.get(key).expect("signaled parent in graph");
                if !entry.is_done() {
                    entry.signal_dep(Some(version));
                }
            }
        }
    }
}

/// Assembles the per-root result map. Unfinished roots with no bubbled error
/// trigger cycle detection.
fn construct_result(
    cx: &EvalContext<'_>,
    visitor: Option<&NodeVisitor>,
    roots: &[NodeKey],
    bubbled: Option<BTreeMap<NodeKey, CommittedValue>>,
) -> EvalResult {
    assert!(
        !cx.config.keep_going || bubbled.is_none(),
        "errors are never bubbled on keep-going evaluations"
    );
    let mut values = BTreeMap::new();
    let mut errors = BTreeMap::new();
    let mut has_error = false;
    let mut cycle_roots = Vec::new();

    for root in roots {
        let Some(committed) = value_maybe_from_error(cx.graph, root, bubbled.as_ref()) else {
            // Evaluation ran out of work without finishing this root; if no
            // error bubbled, only a cycle can explain it.
            if bubbled.is_none() {
                cycle_roots.push(root.clone());
            }
            has_error = true;
            continue;
        };
        // On fast paths this is the only replay these events get.
        crate::event::replay_events(&committed.events, cx.reporter, cx.emitted);
        assert!(
            committed.value.is_some() || committed.error.is_some(),
            "{root} committed with neither value nor error"
        );
        has_error |= committed.error.is_some();
        match (committed.value, committed.error) {
            (_, Some(error)) if !cx.config.keep_going => {
                errors.insert(root.clone(), error);
            }
            (None, Some(error)) => {
                errors.insert(root.clone(), error);
            }
            (Some(value), _) => {
                // In keep-going mode a root with both keeps its value; the
                // caller can still see partial failure through has_error.
                values.insert(root.clone(), value);
            }
            (None, None) => unreachable!(),
        }
    }

    if !cycle_roots.is_empty() {
        let visitor = visitor.expect("cycle roots imply a scheduled evaluation");
        cycles::check_for_cycles(cx, visitor, cycle_roots, &mut errors);
    }
    assert!(
        bubbled.is_none() || has_error,
        "an error bubbled but no root is in error"
    );

    EvalResult::new(values, errors, has_error)
}
