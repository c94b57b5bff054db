//! # skein-core
//!
//! A Rust library for parallel, incremental evaluation of keyed dependency
//! graphs.
//!
//! The name "skein" comes from a loosely coiled bundle of yarn: pull one
//! thread and only what it is tangled with moves.
//!
//! ## Overview
//!
//! skein-core evaluates a demand-driven computation graph: clients request
//! the values of one or more root keys, and the evaluator walks their
//! transitive dependencies, invoking user-supplied builders to produce each
//! node's value. Results are memoized in a persistent graph; on later
//! evaluations, nodes whose transitive inputs did not change are re-used
//! without running their builders.
//!
//! ### Key Features
//!
//! - **Parallel evaluation**: a bounded worker pool evaluates independent
//!   subgraphs concurrently, with per-node locking and no global lock
//! - **Incremental re-evaluation**: invalidated nodes are change-checked
//!   group by group; a rebuild that produces an equal value does not
//!   propagate to parents
//! - **Cooperative suspension**: a builder missing dependencies returns
//!   early and yields its worker slot; it resumes when the last dependency
//!   completes, without blocking a thread
//! - **Error bubbling**: in fail-fast mode the first failure is walked up
//!   reverse edges so the requested root reports the most specific error
//! - **Keep-going mode**: failures stay on their nodes and unrelated roots
//!   still finish
//! - **Cycle detection**: stalled evaluations are diagnosed with the full
//!   cycle path per root
//! - **Event streaming**: builder warnings/errors aggregate across shared
//!   subtrees and replay through a reporter exactly once
//!
//! ## Quick Start
//!
//! ```rust
//! use skein_core::builder::{node_value, BuilderRegistry};
//! use skein_core::config::EvalConfig;
//! use skein_core::evaluator::Evaluator;
//! use skein_core::graph::Version;
//! use skein_core::nodekey::NodeKey;
//!
//! let mut builders = BuilderRegistry::new();
//! builders.register_fn("leaf", |key, _env| {
//!     Ok(Some(node_value(key.id().to_uppercase())))
//! });
//! builders.register_fn("cat", |key, env| {
//!     let mut combined = String::new();
//!     let deps: Vec<NodeKey> = key
//!         .id()
//!         .split('+')
//!         .map(|id| NodeKey::new("leaf", id))
//!         .collect();
//!     for (_key, value) in env.get_deps(deps) {
//!         match value {
//!             Some(value) => {
//!                 combined.push_str(value.as_any().downcast_ref::<String>().unwrap())
//!             }
//!             None => return Ok(None),
//!         }
//!     }
//!     Ok(Some(node_value(combined)))
//! });
//!
//! let evaluator = Evaluator::new(builders, EvalConfig::default());
//! let root = NodeKey::new("cat", "a+b");
//! let result = evaluator.eval(&[root.clone()], Version(1)).unwrap();
//! assert_eq!(result.get_as::<String>(&root).unwrap(), "AB");
//! ```
//!
//! ## Core Concepts
//!
//! ### Builders and restarts
//!
//! A builder asks for dependency values through its environment. When a
//! requested dep is not done yet, the environment records the miss and the
//! builder returns `Ok(None)`; the evaluator schedules the missing deps and
//! re-invokes the builder once they all complete. Builders must therefore be
//! deterministic for a given key and set of dep values. Cheap restarts are
//! the mechanism that lets one worker slot serve many in-flight nodes.
//!
//! ### Versions and change pruning
//!
//! Every evaluation runs at a caller-supplied non-decreasing
//! [`Version`](graph::Version). A node records the version at which its
//! value last changed. After
//! [`invalidate`](evaluator::Evaluator::invalidate), a node re-checks its
//! deps group by group: if every dep's version is not newer than the node's
//! own, the old value is verified clean without running the builder; if a
//! rebuild produces an equal value, the node keeps its old version and its
//! parents are pruned the same way.
//!
//! ### Errors
//!
//! Builder failures become [`ErrorInfo`] on their node. Fail-fast
//! evaluations stop at the first failure and bubble it up reverse edges to a
//! requested root; keep-going evaluations record errors and continue with
//! everything unaffected. Dependency cycles are reported per root with the
//! offending path.
//!
//! ## Module Guide
//!
//! Start with [`evaluator::Evaluator`] and [`builder::BuilderRegistry`];
//! [`graph`] holds the node state machine and store, [`event`] the reporting
//! plumbing.

pub mod builder;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod graph;
pub mod nodekey;
pub mod result;
#[cfg(test)]
mod tests;

pub use error::*;
