//! Failure handling: keep-going vs fail-fast, bubbling, transience,
//! interruption, and event replay on error.

use parking_lot::Mutex;
use std::sync::Arc;
use test_log::test;

use super::helpers::{node, GraphFixture};
use crate::builder::node_value;
use crate::config::EvalConfig;
use crate::error::{BuilderError, EvalError};
use crate::evaluator::Evaluator;
use crate::event::{EventReporter, TaggedEvents};
use crate::graph::Version;
use crate::nodekey::NodeKey;

#[derive(Default)]
struct RecordingReporter {
    messages: Mutex<Vec<String>>,
}

impl EventReporter for RecordingReporter {
    fn warning(&self, _tag: Option<&str>, message: &str) {
        self.messages.lock().push(format!("warn:{message}"));
    }

    fn error(&self, _tag: Option<&str>, message: &str) {
        self.messages.lock().push(format!("error:{message}"));
    }
}

#[test]
fn keep_going_stores_child_error_on_the_parent() {
    let fixture = GraphFixture::new();
    fixture.set_edges("p", &["q"]);
    fixture.set_error("q", BuilderError::new("boom"));
    let evaluator = fixture.evaluator_with(EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    });

    let result = evaluator.eval(&[node("p")], Version(1)).unwrap();
    assert!(result.has_error());
    let error = result.error(&node("p")).unwrap();
    assert_eq!(error.root_causes, [node("q")].into_iter().collect());
    assert_eq!(error.builder_error.as_ref().unwrap().message, "boom");
    assert!(result.get(&node("p")).is_none());
}

#[test]
fn fail_fast_bubbles_the_error_to_the_requested_root() {
    let fixture = GraphFixture::new();
    fixture.set_edges("p", &["q"]);
    fixture.set_error("q", BuilderError::new("boom"));
    let evaluator = fixture.evaluator();

    let result = evaluator.eval(&[node("p")], Version(1)).unwrap();
    assert!(result.has_error());
    let error = result.error(&node("p")).unwrap();
    assert_eq!(error.root_causes, [node("q")].into_iter().collect());
    assert_eq!(error.builder_error.as_ref().unwrap().message, "boom");

    let graph = evaluator.graph();
    // The failing node commits with its error; the bubbled parent is never
    // written to the graph and is cleaned as in-flight.
    let q = graph.get(&node("q")).unwrap();
    assert!(q.is_done());
    assert!(q.error_info().is_some());
    assert!(graph.get(&node("p")).is_none());
}

#[test]
fn fail_fast_cleans_unfinished_siblings() {
    let fixture = GraphFixture::new();
    fixture.set_edges("p", &["q", "r"]);
    fixture.set_edges("r", &["s"]);
    fixture.set_error("q", BuilderError::new("boom"));
    let evaluator = fixture.evaluator_with(EvalConfig {
        thread_count: 1,
        ..EvalConfig::default()
    });

    let result = evaluator.eval(&[node("p")], Version(1)).unwrap();
    assert!(result.has_error());

    // No entry is left mid-build, and no removed node leaves a dangling
    // reverse edge behind.
    let graph = evaluator.graph();
    for key in graph.keys() {
        let entry = graph.get(&key).unwrap();
        assert!(entry.is_done(), "{key} left unfinished after fail-fast");
        for parent in entry.reverse_deps() {
            assert!(
                graph.get(&parent).is_some(),
                "{key} holds a reverse edge to removed {parent}"
            );
        }
    }
}

#[test]
fn keep_going_evaluates_unrelated_roots_despite_failure() {
    let fixture = GraphFixture::new();
    fixture.set_error("bad", BuilderError::new("boom"));
    let evaluator = fixture.evaluator_with(EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    });

    let result = evaluator
        .eval(&[node("good"), node("bad")], Version(1))
        .unwrap();
    assert!(result.has_error());
    assert_eq!(result.get_as::<String>(&node("good")).unwrap(), "GOOD");
    assert!(result.error(&node("bad")).is_some());
}

#[test]
fn builder_recovers_from_a_child_error_it_can_handle() {
    let fixture = GraphFixture::new();
    fixture.set_error("flaky", BuilderError::new("boom"));
    let mut registry = fixture.registry();
    registry.register_fn("fallback", |_key, env| {
        match env.get_dep_or_error(node("flaky")) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                if env.deps_missing() {
                    Ok(None)
                } else {
                    Ok(Some(node_value("EMPTY".to_string())))
                }
            }
            Err(error) => {
                // The dep failed; substitute a default instead.
                assert_eq!(error.message, "boom");
                Ok(Some(node_value("RECOVERED".to_string())))
            }
        }
    });
    let evaluator = Evaluator::new(
        registry,
        EvalConfig {
            keep_going: true,
            ..EvalConfig::default()
        },
    );

    let root = NodeKey::new("fallback", "f");
    let result = evaluator.eval(&[root.clone()], Version(1)).unwrap();
    // The root recovered with a value, but the result still records that
    // part of the graph failed.
    assert_eq!(result.get_as::<String>(&root).unwrap(), "RECOVERED");
    assert!(result.has_error());
}

#[test]
fn transient_errors_are_retried_on_the_next_evaluation() {
    let fixture = GraphFixture::new();
    fixture.set_error("r", BuilderError::transient("network down"));
    let evaluator = fixture.evaluator_with(EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    });

    let result = evaluator.eval(&[node("r")], Version(1)).unwrap();
    assert!(result.error(&node("r")).unwrap().is_transient);
    assert_eq!(fixture.build_count("r"), 1);

    // The failure resolves out of band; the next evaluation retries.
    fixture.clear_error("r");
    let result = evaluator.eval(&[node("r")], Version(2)).unwrap();
    assert_eq!(result.get_as::<String>(&node("r")).unwrap(), "R");
    assert_eq!(fixture.build_count("r"), 2);
}

#[test]
fn transient_errors_are_retried_even_while_still_failing() {
    let fixture = GraphFixture::new();
    fixture.set_error("r", BuilderError::transient("network down"));
    let evaluator = fixture.evaluator_with(EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    });

    evaluator.eval(&[node("r")], Version(1)).unwrap();
    evaluator.eval(&[node("r")], Version(2)).unwrap();
    assert_eq!(fixture.build_count("r"), 2);
}

#[test]
fn permanent_errors_are_not_retried() {
    let fixture = GraphFixture::new();
    fixture.set_error("r", BuilderError::new("broken"));
    let evaluator = fixture.evaluator_with(EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    });

    evaluator.eval(&[node("r")], Version(1)).unwrap();
    let result = evaluator.eval(&[node("r")], Version(2)).unwrap();
    assert!(result.error(&node("r")).is_some());
    assert_eq!(fixture.build_count("r"), 1);
}

#[test]
fn events_replay_once_even_for_failing_builds() {
    let fixture = GraphFixture::new();
    let mut registry = fixture.registry();
    registry.register_fn("warner", |_key, env| {
        env.report_warning("something looks off");
        Err(BuilderError::new("and then it broke"))
    });
    let reporter = Arc::new(RecordingReporter::default());
    let evaluator = Evaluator::new(
        registry,
        EvalConfig {
            keep_going: true,
            ..EvalConfig::default()
        },
    )
    .with_reporter(reporter.clone());

    let root = NodeKey::new("warner", "w");
    let result = evaluator.eval(&[root.clone()], Version(1)).unwrap();
    assert!(result.has_error());
    let messages = reporter.messages.lock().clone();
    assert_eq!(messages, vec!["warn:something looks off".to_string()]);

    // A second evaluation re-uses the node and does not replay.
    drop(messages);
    evaluator.eval(&[root], Version(2)).unwrap();
    assert_eq!(reporter.messages.lock().len(), 1);
}

#[test]
fn parent_replays_child_events_through_shared_sets() {
    let fixture = GraphFixture::new();
    let mut registry = fixture.registry();
    registry.register_fn("noisy", |_key, env| {
        env.report_warning("child warning");
        Ok(Some(node_value("NOISY".to_string())))
    });
    registry.register_fn("quiet", |_key, env| {
        match env.get_dep(NodeKey::new("noisy", "n")) {
            Some(_) => Ok(Some(node_value("QUIET".to_string()))),
            None => Ok(None),
        }
    });
    let reporter = Arc::new(RecordingReporter::default());
    let evaluator =
        Evaluator::new(registry, EvalConfig::default()).with_reporter(reporter.clone());

    evaluator
        .eval(&[NodeKey::new("quiet", "q")], Version(1))
        .unwrap();
    // The child's warning reached the reporter exactly once, despite being
    // aggregated into the parent's event set as well.
    assert_eq!(
        reporter.messages.lock().clone(),
        vec!["warn:child warning".to_string()]
    );
}

#[test]
#[should_panic(expected = "builder exploded")]
fn builder_panics_are_fatal() {
    let fixture = GraphFixture::new();
    let mut registry = fixture.registry();
    registry.register_fn("bomb", |_key, _env| panic!("builder exploded"));
    let evaluator = Evaluator::new(registry, EvalConfig::default());
    let _ = evaluator.eval(&[NodeKey::new("bomb", "b")], Version(1));
}

#[test]
fn interruption_cleans_the_graph_and_reports_interrupted() {
    let fixture = GraphFixture::new();
    let mut registry = fixture.registry();
    let interrupt_slot = Arc::new(Mutex::new(None::<crate::evaluator::InterruptHandle>));
    let builder_slot = interrupt_slot.clone();
    registry.register_fn("slow", move |_key, env| {
        // Interrupt mid-build; the evaluator observes it at the builder
        // boundary and abandons the commit.
        if let Some(handle) = builder_slot.lock().as_ref() {
            handle.interrupt();
        }
        let _ = env;
        Ok(Some(node_value("LATE".to_string())))
    });
    let evaluator = Evaluator::new(registry, EvalConfig::default());
    *interrupt_slot.lock() = Some(evaluator.interrupt_handle());

    let root = NodeKey::new("slow", "s");
    let result = evaluator.eval(&[root.clone()], Version(1));
    assert_eq!(result.unwrap_err(), EvalError::Interrupted);

    // The half-built node was garbage collected.
    assert!(evaluator.graph().get(&root).is_none());

    // With the handle cleared, a later evaluation starts clean and
    // succeeds.
    *interrupt_slot.lock() = None;
    let result = evaluator.eval(&[root.clone()], Version(2)).unwrap();
    assert_eq!(result.get_as::<String>(&root).unwrap(), "LATE");
}

#[test]
fn error_info_serializes_for_external_reporting() {
    let fixture = GraphFixture::new();
    fixture.set_edges("p", &["q"]);
    fixture.set_error("q", BuilderError::new("boom"));
    let evaluator = fixture.evaluator_with(EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    });

    let result = evaluator.eval(&[node("p")], Version(1)).unwrap();
    let error = result.error(&node("p")).unwrap();
    let json = serde_json::to_string(error).unwrap();
    let parsed: crate::error::ErrorInfo = serde_json::from_str(&json).unwrap();
    assert_eq!(&parsed, error);
}

#[test]
fn tagged_events_round_trip_through_serde() {
    let events = TaggedEvents {
        tag: Some("codec".to_string()),
        events: vec![
            crate::event::BuildEvent::warning("slow parse"),
            crate::event::BuildEvent::error("bad input"),
        ],
    };
    let json = serde_json::to_string(&events).unwrap();
    let parsed: TaggedEvents = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, events);
}
