use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::nodekey::NodeKey;

/// Failure signaled by a builder for one node.
///
/// A transient error marks a failure that may resolve without any input
/// changing (an unreachable remote, a race with an external process). Nodes
/// that commit a transient error gain an implicit dependency on the
/// error-transience key, which is re-stamped on every evaluation, so they are
/// rebuilt on the next [`eval`](crate::evaluator::Evaluator::eval) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct BuilderError {
    pub message: String,
    pub transient: bool,
}

impl BuilderError {
    pub fn new(message: impl Into<String>) -> Self {
        BuilderError {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        BuilderError {
            message: message.into(),
            transient: true,
        }
    }
}

/// One dependency cycle, as seen from a requested root: the acyclic path
/// from the root to the first node on the cycle, then the cycle itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleInfo {
    pub path_to_cycle: Vec<NodeKey>,
    pub cycle: Vec<NodeKey>,
}

impl fmt::Display for CycleInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let cycle = self
            .cycle
            .iter()
            .map(NodeKey::to_string)
            .collect::<Vec<String>>()
            .join(" -> ");
        write!(f, "cycle [{cycle}]")
    }
}

/// The aggregate error recorded on a node.
///
/// Synthesized from a builder failure, from the union of child errors when a
/// parent had failing children but did not itself fail, or from a detected
/// cycle. `root_causes` names the keys whose builders originally failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub root_causes: BTreeSet<NodeKey>,
    pub builder_error: Option<BuilderError>,
    pub cycles: Vec<CycleInfo>,
    pub is_transient: bool,
}

impl ErrorInfo {
    pub fn from_builder_error(key: &NodeKey, error: BuilderError) -> Self {
        let is_transient = error.transient;
        ErrorInfo {
            root_causes: BTreeSet::from([key.clone()]),
            builder_error: Some(error),
            cycles: Vec::new(),
            is_transient,
        }
    }

    pub fn from_cycle(cycle: CycleInfo) -> Self {
        ErrorInfo {
            root_causes: BTreeSet::new(),
            builder_error: None,
            cycles: vec![cycle],
            is_transient: false,
        }
    }

    /// Union of child errors. The first underlying builder error is carried
    /// through so roots surface the original failure; cycles concatenate;
    /// transience is sticky.
    pub fn from_children(children: Vec<ErrorInfo>) -> Self {
        let mut root_causes = BTreeSet::new();
        let mut builder_error = None;
        let mut cycles = Vec::new();
        let mut is_transient = false;
        for child in children {
            root_causes.extend(child.root_causes);
            if builder_error.is_none() {
                builder_error = child.builder_error;
            }
            cycles.extend(child.cycles);
            is_transient |= child.is_transient;
        }
        ErrorInfo {
            root_causes,
            builder_error,
            cycles,
            is_transient,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(error) = &self.builder_error {
            return write!(f, "{error}");
        }
        if let Some(cycle) = self.cycles.first() {
            return write!(f, "{cycle}");
        }
        write!(f, "error in dependencies")
    }
}

/// Evaluation-level failure returned by
/// [`Evaluator::eval`](crate::evaluator::Evaluator::eval). Per-node failures
/// are reported through [`EvalResult`](crate::result::EvalResult) instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum EvalError {
    /// Evaluation was cooperatively interrupted. The graph is left
    /// consistent; partially evaluated nodes have been removed.
    #[error("evaluation interrupted")]
    Interrupted,
}

static ERROR_TRANSIENCE: Lazy<NodeKey> = Lazy::new(|| NodeKey::new("error-transience", ""));

/// The singleton key every transiently failed node implicitly depends on.
/// Its entry is re-stamped at the start of each evaluation, which is what
/// forces transient errors to be re-built.
pub fn error_transience_key() -> &'static NodeKey {
    &ERROR_TRANSIENCE
}

/// Marker value committed for the error-transience key. Deliberately never
/// equal to itself, so every evaluation's commit advances the entry's
/// version and dirty parents always observe a changed child.
#[derive(Debug)]
pub(crate) struct ErrorTransience;

impl PartialEq for ErrorTransience {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}
