//! Cycle detection over the unfinished part of the graph.
//!
//! Runs only when an evaluation drained its queue without a bubbled error
//! but some requested roots are still not done: the only way that happens is
//! a dependency cycle. The walk is an iterative depth-first search with an
//! explicit stack; a frame marker signals that a node's whole subtree has
//! been visited. Done entries are skipped, as they are transitively
//! error-free.

use std::collections::{BTreeMap, BTreeSet};

use super::env::BuilderEnv;
use super::visitor::NodeVisitor;
use super::EvalContext;
use crate::error::{CycleInfo, ErrorInfo};
use crate::event::EventSet;
use crate::graph::entry::{CommittedValue, DirtyState, NodeEntry};
use crate::graph::NodeGraph;
use crate::nodekey::NodeKey;

enum Frame {
    Visit(NodeKey),
    /// Pushed below a node's children: popping it means the node's whole
    /// subtree has been visited.
    ChildrenFinished,
}

/// Stand-in payload for the one unfinished child of a cycle node while its
/// parent is committed in keep-going mode.
#[derive(Debug, PartialEq)]
struct CyclePlaceholder;

/// Checks each still-unfinished root for cycles, adding a synthesized error
/// per root. In fail-fast mode the first root with a cycle ends the search.
pub(crate) fn check_for_cycles(
    cx: &EvalContext<'_>,
    visitor: &NodeVisitor,
    bad_roots: Vec<NodeKey>,
    errors: &mut BTreeMap<NodeKey, ErrorInfo>,
) {
    for root in bad_roots {
        match check_root_for_cycles(cx, visitor, &root) {
            Some(error) => {
                assert!(
                    !error.cycles.is_empty(),
                    "{root} was not evaluated but is not part of a cycle"
                );
                errors.insert(root, error);
                if !cx.config.keep_going {
                    return;
                }
            }
            None => {
                // No cycle below this root; it simply had not finished when
                // the fail-fast evaluation stopped making progress.
                assert!(!cx.config.keep_going, "{root} unfinished without a cycle");
            }
        }
    }
}

fn check_root_for_cycles(
    cx: &EvalContext<'_>,
    visitor: &NodeVisitor,
    root: &NodeKey,
) -> Option<ErrorInfo> {
    let graph = cx.graph;
    let mut cycles_found = 0usize;
    // The DFS path currently being visited, with a set view for O(1)
    // membership checks.
    let mut graph_path: Vec<NodeKey> = Vec::new();
    let mut path_set: BTreeSet<NodeKey> = BTreeSet::new();
    let mut to_visit: Vec<Frame> = vec![Frame::Visit(root.clone())];

    while let Some(frame) = to_visit.pop() {
        let key = match frame {
            Frame::ChildrenFinished => {
                let key = graph_path.pop().expect("marker without a path node");
                path_set.remove(&key);
                let entry = graph.get(&key).expect("path node in graph");
                if entry.is_done() {
                    // First/last node of an already-processed cycle.
                    continue;
                }
                if !cx.config.keep_going {
                    // A cycle below this node would have returned already;
                    // the node just had not finished evaluating.
                    continue;
                }
                if cycles_found < cx.config.max_cycles_reported {
                    assert!(entry.is_ready(), "{key} not ready with all children finished");
                } else if !entry.is_ready() {
                    remove_incomplete_children_for_cycle(
                        graph,
                        &key,
                        &entry,
                        entry.temporary_direct_deps(),
                    );
                }
                let direct_deps = entry.temporary_direct_deps();
                let error_deps = children_errors_for_cycle(graph, &direct_deps);
                assert!(
                    !error_deps.is_empty(),
                    "{key} did not evaluate but has no child errors"
                );
                let mut env = BuilderEnv::new(cx, visitor, key, direct_deps, None);
                env.set_error(ErrorInfo::from_children(error_deps));
                env.commit(false);
                continue;
            }
            Frame::Visit(key) => key,
        };

        let Some(entry) = graph.get(&key) else {
            continue;
        };
        if entry.is_done() {
            continue;
        }
        if cycles_found == cx.config.max_cycles_reported {
            // Stop hunting for more cycles to bound the traversal.
            continue;
        }

        if path_set.contains(&key) {
            let cycle_start = graph_path
                .iter()
                .position(|k| k == &key)
                .expect("path set and path list out of sync");
            cycles_found += 1;
            let cycle: Vec<NodeKey> = graph_path[cycle_start..].to_vec();
            tracing::debug!("[evaluator] found cycle of length {}", cycle.len());
            if entry.dirty_state() == Some(DirtyState::CheckDependencies) {
                // The one unchecked child is on the cycle path, so it will
                // survive the descendant pruning below; account for its
                // missing signal now.
                entry.signal_dep(None);
            }
            if cx.config.keep_going {
                let cycle_child = select_cycle_child(&key, &graph_path, cycle_start);
                remove_descendants_of_cycle_node(
                    graph,
                    &key,
                    &entry,
                    &cycle_child,
                    &mut to_visit,
                    graph_path.len() - cycle_start,
                );
                let placeholder_value: crate::builder::Value =
                    std::sync::Arc::new(CyclePlaceholder);
                let placeholder = BTreeMap::from([(
                    cycle_child.clone(),
                    CommittedValue {
                        value: Some(placeholder_value),
                        error: None,
                        events: EventSet::empty(),
                    },
                )]);
                let direct_deps = entry.temporary_direct_deps();
                let mut all_errors = children_errors(graph, &direct_deps, &cycle_child);
                all_errors.push(ErrorInfo::from_cycle(CycleInfo {
                    path_to_cycle: Vec::new(),
                    cycle,
                }));
                let mut env =
                    BuilderEnv::new(cx, visitor, key.clone(), direct_deps, Some(&placeholder));
                env.set_error(ErrorInfo::from_children(all_errors));
                env.commit(false);
                continue;
            } else {
                assert_eq!(
                    graph_path.first(),
                    Some(root),
                    "cycle path does not start at the requested root"
                );
                return Some(ErrorInfo::from_cycle(CycleInfo {
                    path_to_cycle: graph_path[..cycle_start].to_vec(),
                    cycle,
                }));
            }
        }

        let children = entry.temporary_direct_deps();
        if children.is_empty() {
            continue;
        }
        to_visit.push(Frame::ChildrenFinished);
        graph_path.push(key.clone());
        path_set.insert(key);
        for child in children {
            to_visit.push(Frame::Visit(child));
        }
    }

    if cx.config.keep_going {
        let entry = graph.get(root).expect("root in graph");
        assert!(entry.is_done(), "{root} not done after cycle checking");
        entry.error_info()
    } else {
        None
    }
}

/// The child of `key` on the cycle just found; `key` itself for a self-edge.
fn select_cycle_child(key: &NodeKey, graph_path: &[NodeKey], cycle_start: usize) -> NodeKey {
    if cycle_start + 1 == graph_path.len() {
        key.clone()
    } else {
        graph_path[cycle_start + 1].clone()
    }
}

/// Errors of all done children; at least one must carry a cycle.
fn children_errors_for_cycle(graph: &NodeGraph, children: &BTreeSet<NodeKey>) -> Vec<ErrorInfo> {
    let mut errors = Vec::new();
    let mut found_cycle = false;
    for child in children {
        let entry = get_and_check_done(graph, child);
        if let Some(error) = entry.error_info() {
            found_cycle |= !error.cycles.is_empty();
            errors.push(error);
        }
    }
    assert!(found_cycle, "no cycle among children in error");
    errors
}

/// Errors of all children, where `unfinished_child` alone may not be done.
fn children_errors(
    graph: &NodeGraph,
    children: &BTreeSet<NodeKey>,
    unfinished_child: &NodeKey,
) -> Vec<ErrorInfo> {
    let mut errors = Vec::new();
    for child in children {
        let error = if child == unfinished_child {
            match graph.get(child) {
                Some(entry) if entry.is_done() => entry.error_info(),
                _ => None,
            }
        } else {
            get_and_check_done(graph, child).error_info()
        };
        if let Some(error) = error {
            errors.push(error);
        }
    }
    errors
}

/// Removes direct children of `key` other than `cycle_child` from the
/// traversal stack and from the entry itself, and restores the ready
/// invariant. Children must not be visited after their parent was committed;
/// a parent can only be built after its children.
fn remove_descendants_of_cycle_node(
    graph: &NodeGraph,
    key: &NodeKey,
    entry: &NodeEntry,
    cycle_child: &NodeKey,
    to_visit: &mut Vec<Frame>,
    cycle_length: usize,
) {
    let mut unvisited_deps = entry.temporary_direct_deps();
    unvisited_deps.remove(cycle_child);
    remove_incomplete_children_for_cycle(graph, key, entry, unvisited_deps.clone());
    if !entry.is_ready() {
        // At most the cycle child is now outstanding; it is either done
        // (already committed for a different cycle) or accounted for here.
        entry.signal_dep(None);
    }
    assert!(entry.is_ready(), "{key} not ready after pruning its children");

    // Walk the stack top-down. Every frame above the marker belonging to
    // `key` that is a direct child of it must go; markers delimit the
    // enqueued child groups of the nodes on the cycle path.
    let mut remaining = cycle_length;
    let mut remove_indices = Vec::new();
    for index in (0..to_visit.len()).rev() {
        match &to_visit[index] {
            Frame::ChildrenFinished => {
                remaining -= 1;
                if remaining == 0 {
                    for index in remove_indices {
                        to_visit.remove(index);
                    }
                    return;
                }
            }
            Frame::Visit(descendant) => {
                if remaining == 1 {
                    assert!(
                        unvisited_deps.contains(descendant),
                        "{descendant} on the stack is not a child of {key}"
                    );
                    remove_indices.push(index);
                }
            }
        }
    }
    panic!("fewer than {cycle_length} child groups on the stack while pruning {key}");
}

/// De-registers `key` from each unfinished child and prunes those children
/// from its temporary deps.
fn remove_incomplete_children_for_cycle(
    graph: &NodeGraph,
    key: &NodeKey,
    entry: &NodeEntry,
    children: BTreeSet<NodeKey>,
) {
    let mut unfinished = BTreeSet::new();
    for child in children {
        if let Some(child_entry) = graph.get(&child) {
            if !child_entry.is_done() {
                child_entry.remove_reverse_dep(key);
                unfinished.insert(child);
            }
        }
    }
    entry.remove_unfinished_deps(&unfinished);
}

fn get_and_check_done(graph: &NodeGraph, key: &NodeKey) -> std::sync::Arc<NodeEntry> {
    let entry = graph.get(key).expect("child entry in graph");
    assert!(entry.is_done(), "{key} expected to be done");
    entry
}
