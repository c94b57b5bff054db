//! Builder-emitted events and their aggregation.
//!
//! Warnings and errors emitted while a node builds are captured per node and
//! aggregated *by reference* into an [`EventSet`] shared across every parent
//! of that node. Replay walks the resulting DAG once per set identity, so a
//! diamond-shaped graph never replays a shared subtree twice.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    Warning,
    Error,
}

/// A single stored event emitted by a builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub level: EventLevel,
    pub message: String,
}

impl BuildEvent {
    pub fn warning(message: impl Into<String>) -> Self {
        BuildEvent {
            level: EventLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        BuildEvent {
            level: EventLevel::Error,
            message: message.into(),
        }
    }
}

/// The events one node emitted during a single build, tagged with the
/// builder-supplied tag for that key (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedEvents {
    pub tag: Option<String>,
    pub events: Vec<BuildEvent>,
}

#[derive(Debug)]
struct EventSetNode {
    direct: Vec<TaggedEvents>,
    transitive: Vec<EventSet>,
}

static EMPTY_EVENT_SET: Lazy<EventSet> = Lazy::new(|| {
    EventSet(Arc::new(EventSetNode {
        direct: Vec::new(),
        transitive: Vec::new(),
    }))
});

/// An immutable, reference-shared aggregation of events.
///
/// Parents hold their children's sets by reference rather than copying them,
/// so the memory cost of a diamond is one pointer, and replay can deduplicate
/// on identity.
#[derive(Debug, Clone)]
pub struct EventSet(Arc<EventSetNode>);

impl EventSet {
    pub fn empty() -> EventSet {
        EMPTY_EVENT_SET.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.direct.is_empty() && self.0.transitive.is_empty()
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

/// Accumulates one node's direct events plus its children's sets.
#[derive(Debug, Default)]
pub struct EventSetBuilder {
    direct: Vec<TaggedEvents>,
    transitive: Vec<EventSet>,
}

impl EventSetBuilder {
    pub fn new() -> Self {
        EventSetBuilder::default()
    }

    pub fn add(&mut self, events: TaggedEvents) {
        if !events.events.is_empty() {
            self.direct.push(events);
        }
    }

    pub fn add_transitive(&mut self, set: EventSet) {
        if !set.is_empty() {
            self.transitive.push(set);
        }
    }

    pub fn build(self) -> EventSet {
        if self.direct.is_empty() && self.transitive.is_empty() {
            EventSet::empty()
        } else {
            EventSet(Arc::new(EventSetNode {
                direct: self.direct,
                transitive: self.transitive,
            }))
        }
    }
}

/// External sink for events and progress messages.
///
/// Stored warnings/errors are replayed through this once per build; progress
/// messages are forwarded immediately and never stored.
pub trait EventReporter: Send + Sync {
    fn warning(&self, tag: Option<&str>, message: &str);
    fn error(&self, tag: Option<&str>, message: &str);
    fn progress(&self, message: &str) {
        let _ = message;
    }
}

/// Default reporter that forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl EventReporter for TracingReporter {
    fn warning(&self, tag: Option<&str>, message: &str) {
        match tag {
            Some(tag) => tracing::warn!("[{tag}] {message}"),
            None => tracing::warn!("{message}"),
        }
    }

    fn error(&self, tag: Option<&str>, message: &str) {
        match tag {
            Some(tag) => tracing::error!("[{tag}] {message}"),
            None => tracing::error!("{message}"),
        }
    }

    fn progress(&self, message: &str) {
        tracing::info!("{message}");
    }
}

/// Remembers which [`EventSet`]s have already been replayed, by identity.
///
/// The state outlives a single evaluation: a set replayed while a node
/// committed is not replayed again when the final result is assembled, and a
/// subtree shared between two parents replays exactly once. Replayed sets
/// are kept alive here so an address is never reused for a new set.
#[derive(Debug, Default)]
pub struct EmittedEventState {
    seen: Mutex<HashMap<usize, EventSet>>,
}

impl EmittedEventState {
    pub fn new() -> Self {
        EmittedEventState::default()
    }

    /// Forgets all replayed sets. Mostly useful in tests.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

/// Replays `set` through `reporter`, skipping every subtree already seen by
/// `state`.
pub fn replay_events(set: &EventSet, reporter: &dyn EventReporter, state: &EmittedEventState) {
    let mut stack = vec![set.clone()];
    let mut seen = state.seen.lock();
    while let Some(set) = stack.pop() {
        if set.is_empty() {
            continue;
        }
        if seen.insert(set.id(), set.clone()).is_some() {
            continue;
        }
        for tagged in &set.0.direct {
            for event in &tagged.events {
                match event.level {
                    EventLevel::Warning => reporter.warning(tagged.tag.as_deref(), &event.message),
                    EventLevel::Error => reporter.error(tagged.tag.as_deref(), &event.message),
                }
            }
        }
        for child in &set.0.transitive {
            stack.push(child.clone());
        }
    }
}
