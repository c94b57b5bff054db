//! Crate-internal test suite: shared fixtures plus scenario tests that
//! exercise the evaluator against the graph internals.

pub mod helpers;

mod errors;
