//! Builder-facing types: the type-erased value payload, the [`NodeBuilder`]
//! trait, the per-tag registry, and the optional progress receiver.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BuilderError;
use crate::evaluator::env::BuilderEnv;
use crate::nodekey::{NodeKey, NodeTag};

/// A node's payload. Implemented for every `PartialEq + Debug + Send + Sync`
/// type via the blanket impl; clients downcast with
/// [`as_any`](NodeValue::as_any) or
/// [`EvalResult::get_as`](crate::result::EvalResult::get_as).
///
/// Dynamic equality backs equality-based version suppression: when a rebuild
/// produces a value equal to the previous one (and the dep structure is
/// unchanged), the node's version is not advanced and change does not
/// propagate to parents.
pub trait NodeValue: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn eq_value(&self, other: &dyn NodeValue) -> bool;
}

impl<T> NodeValue for T
where
    T: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_value(&self, other: &dyn NodeValue) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// Shared handle to a committed node payload.
pub type Value = Arc<dyn NodeValue>;

/// Wraps a concrete payload into a [`Value`].
pub fn node_value<T: NodeValue>(value: T) -> Value {
    Arc::new(value)
}

/// Computes the value of one node.
///
/// Contract: a builder may be invoked repeatedly for the same key during a
/// single evaluation, each time with a larger set of already-done deps.
/// Builders must therefore be deterministic given the same key and the same
/// dep values, and must not hold thread primitives across a dep request.
/// Once a builder returns `Ok(Some(..))` it is not re-invoked for that key in
/// the same evaluation.
///
/// Outcomes:
/// - `Ok(Some(value))` with no missing deps: success, the value commits.
/// - `Ok(None)` with newly requested deps: deferred; the builder is re-run
///   once the last missing dep completes.
/// - `Err(..)`: failure; in keep-going mode parents still get signaled, in
///   fail-fast mode the evaluation halts and the error bubbles to a root.
pub trait NodeBuilder: Send + Sync {
    fn build(&self, key: &NodeKey, env: &mut BuilderEnv<'_>) -> Result<Option<Value>, BuilderError>;

    /// Tag attached to this node's stored events for reporting. Defaults to
    /// none.
    fn event_tag(&self, key: &NodeKey) -> Option<String> {
        let _ = key;
        None
    }
}

struct FnBuilder<F>(F);

impl<F> NodeBuilder for FnBuilder<F>
where
    F: Fn(&NodeKey, &mut BuilderEnv<'_>) -> Result<Option<Value>, BuilderError> + Send + Sync,
{
    fn build(&self, key: &NodeKey, env: &mut BuilderEnv<'_>) -> Result<Option<Value>, BuilderError> {
        (self.0)(key, env)
    }
}

/// Maps node-type tags to their builders. Lookup is a single hash probe.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: HashMap<NodeTag, Arc<dyn NodeBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        BuilderRegistry::default()
    }

    pub fn register(&mut self, tag: impl Into<NodeTag>, builder: Arc<dyn NodeBuilder>) -> &mut Self {
        self.builders.insert(tag.into(), builder);
        self
    }

    /// Registers a closure as the builder for `tag`.
    pub fn register_fn<F>(&mut self, tag: impl Into<NodeTag>, build: F) -> &mut Self
    where
        F: Fn(&NodeKey, &mut BuilderEnv<'_>) -> Result<Option<Value>, BuilderError>
            + Send
            + Sync
            + 'static,
    {
        self.register(tag, Arc::new(FnBuilder(build)))
    }

    pub fn get(&self, tag: &NodeTag) -> Option<&Arc<dyn NodeBuilder>> {
        self.builders.get(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

impl fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BuilderRegistry")
            .field("tags", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Whether a node's result came from an actual rebuild or from change
/// pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationState {
    /// The node was rebuilt (or built for the first time) this evaluation.
    Built,
    /// The node's previous value was verified still valid without invoking
    /// its builder, or its rebuild produced an equal value.
    Clean,
}

/// Optional observer of evaluation progress.
pub trait ProgressReceiver: Send + Sync {
    /// A key was enqueued for evaluation (at most once per evaluation).
    fn enqueueing(&self, key: &NodeKey) {
        let _ = key;
    }

    /// A node finished: either rebuilt or verified clean.
    fn evaluated(&self, key: &NodeKey, value: Option<&Value>, state: EvaluationState) {
        let _ = (key, value, state);
    }
}
