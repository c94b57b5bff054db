//! Per-root results of one evaluation.

use std::collections::BTreeMap;

use crate::builder::Value;
use crate::error::ErrorInfo;
use crate::nodekey::NodeKey;

/// What one [`eval`](crate::evaluator::Evaluator::eval) call produced for
/// each requested root: a value, an error, or (in keep-going mode) both, in
/// which case the value is returned here and [`has_error`](Self::has_error)
/// still reports the partial failure.
#[derive(Debug, Default)]
pub struct EvalResult {
    values: BTreeMap<NodeKey, Value>,
    errors: BTreeMap<NodeKey, ErrorInfo>,
    has_error: bool,
}

impl EvalResult {
    pub(crate) fn new(
        values: BTreeMap<NodeKey, Value>,
        errors: BTreeMap<NodeKey, ErrorInfo>,
        has_error: bool,
    ) -> Self {
        EvalResult {
            values,
            errors,
            has_error,
        }
    }

    /// The committed value for a succeeding root.
    pub fn get(&self, key: &NodeKey) -> Option<&Value> {
        self.values.get(key)
    }

    /// Downcast accessor for a succeeding root's value.
    pub fn get_as<T: 'static>(&self, key: &NodeKey) -> Option<&T> {
        self.values.get(key)?.as_any().downcast_ref::<T>()
    }

    /// The error recorded for a failing root.
    pub fn error(&self, key: &NodeKey) -> Option<&ErrorInfo> {
        self.errors.get(key)
    }

    /// True if any requested root failed, even one that also has a value.
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn values(&self) -> &BTreeMap<NodeKey, Value> {
        &self.values
    }

    pub fn errors(&self) -> &BTreeMap<NodeKey, ErrorInfo> {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.errors.is_empty()
    }
}
