//! Shared test utilities for evaluator testing.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::builder::{node_value, BuilderRegistry, EvaluationState, ProgressReceiver, Value};
use crate::config::EvalConfig;
use crate::error::BuilderError;
use crate::evaluator::Evaluator;
use crate::nodekey::NodeKey;

/// Initialize logging for tests.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Key under the shared test tag.
pub fn node(id: &str) -> NodeKey {
    NodeKey::new("node", id)
}

/// A configurable diamond-capable test graph.
///
/// Every node carries the tag `node`. A node's value is its id uppercased,
/// concatenated with the values of its children in edge order. Nodes listed
/// in `errors` fail instead. Completed builds are recorded in order.
#[derive(Clone, Default)]
pub struct GraphFixture {
    edges: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
    errors: Arc<Mutex<BTreeMap<String, BuilderError>>>,
    built: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl GraphFixture {
    pub fn new() -> Self {
        init_logging();
        GraphFixture::default()
    }

    pub fn set_edges(&self, id: &str, children: &[&str]) {
        self.edges.lock().insert(
            id.to_string(),
            children.iter().map(|child| child.to_string()).collect(),
        );
    }

    pub fn set_error(&self, id: &str, error: BuilderError) {
        self.errors.lock().insert(id.to_string(), error);
    }

    pub fn clear_error(&self, id: &str) {
        self.errors.lock().remove(id);
    }

    /// How many times `id`'s builder completed (value or failure).
    pub fn build_count(&self, id: &str) -> usize {
        self.built.lock().iter().filter(|built| *built == id).count()
    }

    /// How many times `id`'s builder was invoked, including restarts that
    /// returned early with missing deps.
    pub fn call_count(&self, id: &str) -> usize {
        self.calls.lock().get(id).copied().unwrap_or(0)
    }

    pub fn built_order(&self) -> Vec<String> {
        self.built.lock().clone()
    }

    pub fn registry(&self) -> BuilderRegistry {
        let edges = self.edges.clone();
        let errors = self.errors.clone();
        let built = self.built.clone();
        let calls = self.calls.clone();
        let mut registry = BuilderRegistry::new();
        registry.register_fn("node", move |key, env| {
            let id = key.id().to_string();
            *calls.lock().entry(id.clone()).or_insert(0) += 1;
            if let Some(error) = errors.lock().get(&id) {
                built.lock().push(id);
                return Err(error.clone());
            }
            let children = edges.lock().get(&id).cloned().unwrap_or_default();
            let mut output = id.to_uppercase();
            if !children.is_empty() {
                let dep_keys: Vec<NodeKey> =
                    children.iter().map(|child| node(child)).collect();
                let values = env.get_deps(dep_keys.clone());
                if env.deps_missing() {
                    return Ok(None);
                }
                for dep_key in &dep_keys {
                    let value = values[dep_key].as_ref().expect("dep value present");
                    output.push_str(value.as_any().downcast_ref::<String>().unwrap());
                }
            }
            built.lock().push(id);
            Ok(Some(node_value(output)))
        });
        registry
    }

    pub fn evaluator(&self) -> Evaluator {
        Evaluator::new(self.registry(), EvalConfig::default())
    }

    pub fn evaluator_with(&self, config: EvalConfig) -> Evaluator {
        Evaluator::new(self.registry(), config)
    }
}

/// Builds the scenario graph `A -> B -> C`, `A -> D`.
pub fn diamond_fixture() -> GraphFixture {
    let fixture = GraphFixture::new();
    fixture.set_edges("a", &["b", "d"]);
    fixture.set_edges("b", &["c"]);
    fixture
}

/// Progress receiver that records callbacks.
#[derive(Default)]
pub struct RecordingProgress {
    pub enqueued: Mutex<Vec<NodeKey>>,
    pub evaluated: Mutex<Vec<(NodeKey, EvaluationState)>>,
}

impl ProgressReceiver for RecordingProgress {
    fn enqueueing(&self, key: &NodeKey) {
        self.enqueued.lock().push(key.clone());
    }

    fn evaluated(&self, key: &NodeKey, _value: Option<&Value>, state: EvaluationState) {
        self.evaluated.lock().push((key.clone(), state));
    }
}

impl RecordingProgress {
    pub fn state_of(&self, key: &NodeKey) -> Option<EvaluationState> {
        self.evaluated
            .lock()
            .iter()
            .rev()
            .find(|(evaluated, _)| evaluated == key)
            .map(|(_, state)| *state)
    }
}
