//! Shared fixtures for integration tests, built only on the public API.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use skein_core::builder::{node_value, BuilderRegistry};
use skein_core::config::EvalConfig;
use skein_core::error::BuilderError;
use skein_core::evaluator::Evaluator;
use skein_core::nodekey::NodeKey;

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn node(id: &str) -> NodeKey {
    NodeKey::new("node", id)
}

/// An adjacency-driven test graph over the public API: each node's value is
/// its id uppercased plus its children's values in edge order.
#[derive(Clone, Default)]
pub struct TestGraph {
    edges: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
    errors: Arc<Mutex<BTreeMap<String, BuilderError>>>,
    built: Arc<Mutex<Vec<String>>>,
}

impl TestGraph {
    pub fn new() -> Self {
        init_logging();
        TestGraph::default()
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

    pub fn build_count(&self, id: &str) -> usize {
        self.built.lock().iter().filter(|built| *built == id).count()
    }

    pub fn registry(&self) -> BuilderRegistry {
        let edges = self.edges.clone();
        let errors = self.errors.clone();
        let built = self.built.clone();
        let mut registry = BuilderRegistry::new();
        registry.register_fn("node", move |key, env| {
            let id = key.id().to_string();
            if let Some(error) = errors.lock().get(&id) {
                built.lock().push(id);
                return Err(error.clone());
            }
            let children = edges.lock().get(&id).cloned().unwrap_or_default();
            let mut output = id.to_uppercase();
            if !children.is_empty() {
                let dep_keys: Vec<NodeKey> = children.iter().map(|child| node(child)).collect();
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

    pub fn evaluator(&self, config: EvalConfig) -> Evaluator {
        Evaluator::new(self.registry(), config)
    }
}
