//! End-to-end evaluation through the public API.

mod common;

use common::{node, TestGraph};
use skein_core::config::EvalConfig;
use skein_core::error::BuilderError;
use skein_core::graph::Version;

#[test]
fn evaluates_a_document_like_dependency_tree() {
    let graph = TestGraph::new();
    graph.set_edges("index", &["intro", "guide"]);
    graph.set_edges("guide", &["appendix"]);
    let evaluator = graph.evaluator(EvalConfig::default());

    let result = evaluator.eval(&[node("index")], Version(1)).unwrap();
    assert!(!result.has_error());
    assert_eq!(
        result.get_as::<String>(&node("index")).unwrap(),
        "INDEXINTROGUIDEAPPENDIX"
    );
}

#[test]
fn concurrent_subgraphs_produce_deterministic_values() {
    let graph = TestGraph::new();
    let mut mids = Vec::new();
    for index in 0..16 {
        let mid = format!("mid{index:02}");
        graph.set_edges(&mid, &[&format!("leaf{index:02}")]);
        mids.push(mid);
    }
    let mid_refs: Vec<&str> = mids.iter().map(String::as_str).collect();
    graph.set_edges("root", &mid_refs);

    for thread_count in [1, 4, 8] {
        let evaluator = graph.evaluator(EvalConfig {
            thread_count,
            ..EvalConfig::default()
        });
        let result = evaluator.eval(&[node("root")], Version(1)).unwrap();
        let value = result.get_as::<String>(&node("root")).unwrap();
        assert!(value.starts_with("ROOTMID00LEAF00"));
        assert!(value.ends_with("MID15LEAF15"));
    }
}

#[test]
fn repeated_evaluation_is_idempotent_and_free() {
    let graph = TestGraph::new();
    graph.set_edges("a", &["b"]);
    let evaluator = graph.evaluator(EvalConfig::default());

    let first = evaluator.eval(&[node("a")], Version(1)).unwrap();
    let second = evaluator.eval(&[node("a")], Version(7)).unwrap();
    assert_eq!(
        first.get_as::<String>(&node("a")),
        second.get_as::<String>(&node("a"))
    );
    assert_eq!(graph.build_count("a"), 1);
    assert_eq!(graph.build_count("b"), 1);
}

#[test]
fn fail_fast_reports_the_deepest_cause_at_the_root() {
    let graph = TestGraph::new();
    graph.set_edges("top", &["middle"]);
    graph.set_edges("middle", &["bottom"]);
    graph.set_error("bottom", BuilderError::new("disk on fire"));
    let evaluator = graph.evaluator(EvalConfig::default());

    let result = evaluator.eval(&[node("top")], Version(1)).unwrap();
    assert!(result.has_error());
    let error = result.error(&node("top")).unwrap();
    assert_eq!(error.builder_error.as_ref().unwrap().message, "disk on fire");
    assert!(error.root_causes.contains(&node("bottom")));
}

#[test]
fn keep_going_collects_independent_failures() {
    let graph = TestGraph::new();
    graph.set_edges("all", &["ok1", "bad1", "ok2", "bad2"]);
    graph.set_error("bad1", BuilderError::new("first"));
    graph.set_error("bad2", BuilderError::new("second"));
    let evaluator = graph.evaluator(EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    });

    let result = evaluator.eval(&[node("all")], Version(1)).unwrap();
    let error = result.error(&node("all")).unwrap();
    assert_eq!(
        error.root_causes,
        [node("bad1"), node("bad2")].into_iter().collect()
    );
    // Healthy siblings still built.
    assert_eq!(graph.build_count("ok1"), 1);
    assert_eq!(graph.build_count("ok2"), 1);
}

#[test]
fn cycle_is_reported_with_its_path() {
    let graph = TestGraph::new();
    graph.set_edges("entry", &["loop_a"]);
    graph.set_edges("loop_a", &["loop_b"]);
    graph.set_edges("loop_b", &["loop_a"]);
    let evaluator = graph.evaluator(EvalConfig::default());

    let result = evaluator.eval(&[node("entry")], Version(1)).unwrap();
    let error = result.error(&node("entry")).unwrap();
    assert_eq!(error.cycles.len(), 1);
    assert_eq!(error.cycles[0].path_to_cycle, vec![node("entry")]);
    assert_eq!(
        error.cycles[0].cycle,
        vec![node("loop_a"), node("loop_b")]
    );
}
