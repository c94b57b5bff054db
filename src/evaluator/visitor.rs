//! The work queue and its bounded worker pool.
//!
//! Workers drain a shared queue of ready keys inside a thread scope; the
//! first builder failure (fail-fast), interrupt, or builder panic parks a
//! halt in the queue and stops the pool. The in-flight set tracks every key
//! that was enqueued and has not finished, so an aborted evaluation can be
//! cleaned back to a consistent graph.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::builder::ProgressReceiver;
use crate::error::ErrorInfo;
use crate::graph::NodeGraph;
use crate::nodekey::NodeKey;

/// The failure that halted a fail-fast evaluation: the key whose builder
/// failed and the error it produced.
#[derive(Debug)]
pub(crate) struct SchedulerError {
    pub key: NodeKey,
    pub error: ErrorInfo,
}

/// Why a worker wants the pool stopped.
pub(crate) enum EvalAbort {
    Scheduler(SchedulerError),
    Interrupted,
}

/// Why the pool stopped.
pub(crate) enum Halt {
    Error(SchedulerError),
    Interrupted,
    Panic(Box<dyn Any + Send>),
}

struct QueueState {
    queue: VecDeque<NodeKey>,
    /// Keys currently being evaluated by a worker.
    active: usize,
    halt: Option<Halt>,
}

pub(crate) struct NodeVisitor {
    queue: Mutex<QueueState>,
    work_available: Condvar,
    inflight: Mutex<BTreeSet<NodeKey>>,
    interrupt: Arc<AtomicBool>,
    progress: Option<Arc<dyn ProgressReceiver>>,
}

impl NodeVisitor {
    pub fn new(interrupt: Arc<AtomicBool>, progress: Option<Arc<dyn ProgressReceiver>>) -> Self {
        NodeVisitor {
            queue: Mutex::new(QueueState {
                queue: VecDeque::new(),
                active: 0,
                halt: None,
            }),
            work_available: Condvar::new(),
            inflight: Mutex::new(BTreeSet::new()),
            interrupt,
            progress,
        }
    }

    /// Inserts `key` into the work queue. The progress receiver is notified
    /// on the first enqueue of a key per evaluation.
    pub fn enqueue_evaluation(&self, key: &NodeKey) {
        if self.inflight.lock().insert(key.clone()) {
            if let Some(progress) = &self.progress {
                progress.enqueueing(key);
            }
        }
        let mut q = self.queue.lock();
        q.queue.push_back(key.clone());
        self.work_available.notify_one();
    }

    /// Removes `key` from the in-flight set once it has committed.
    pub fn notify_done(&self, key: &NodeKey) {
        self.inflight.lock().remove(key);
    }

    pub fn is_inflight(&self, key: &NodeKey) -> bool {
        self.inflight.lock().contains(key)
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Runs `evaluate` over the queue with `thread_count` workers until the
    /// queue drains or a halt is parked. Returns the halt, if any.
    pub fn run<F>(&self, thread_count: usize, evaluate: F) -> Option<Halt>
    where
        F: Fn(NodeKey) -> Result<(), EvalAbort> + Sync,
    {
        let workers = thread_count.max(1);
        std::thread::scope(|scope| {
            for worker in 0..workers {
                let evaluate = &evaluate;
                scope.spawn(move || self.worker_loop(worker, evaluate));
            }
        });
        self.queue.lock().halt.take()
    }

    fn worker_loop<F>(&self, worker: usize, evaluate: &F)
    where
        F: Fn(NodeKey) -> Result<(), EvalAbort> + Sync,
    {
        loop {
            let key = {
                let mut q = self.queue.lock();
                loop {
                    if q.halt.is_some() {
                        return;
                    }
                    if self.interrupted() {
                        q.halt = Some(Halt::Interrupted);
                        self.work_available.notify_all();
                        return;
                    }
                    if let Some(key) = q.queue.pop_front() {
                        q.active += 1;
                        break key;
                    }
                    if q.active == 0 {
                        // Nothing queued and nobody working: evaluation is
                        // complete. Wake the other waiters so they exit too.
                        self.work_available.notify_all();
                        return;
                    }
                    self.work_available
                        .wait_for(&mut q, Duration::from_millis(100));
                }
            };

            tracing::debug!("[evaluator worker {worker}] evaluating {key}");
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| evaluate(key)));

            let mut q = self.queue.lock();
            q.active -= 1;
            match outcome {
                Ok(Ok(())) => {
                    if q.active == 0 && q.queue.is_empty() {
                        self.work_available.notify_all();
                    }
                }
                Ok(Err(abort)) => {
                    if q.halt.is_none() {
                        q.halt = Some(match abort {
                            EvalAbort::Scheduler(error) => Halt::Error(error),
                            EvalAbort::Interrupted => Halt::Interrupted,
                        });
                    }
                    self.work_available.notify_all();
                    return;
                }
                Err(payload) => {
                    if q.halt.is_none() {
                        q.halt = Some(Halt::Panic(payload));
                    }
                    self.work_available.notify_all();
                    return;
                }
            }
        }
    }

    /// Removes partially evaluated entries from the graph and de-registers
    /// their reverse-dep edges from dep entries still present, leaving the
    /// graph consistent for the next evaluation.
    pub fn clean(&self, graph: &NodeGraph) {
        let keys: Vec<NodeKey> = std::mem::take(&mut *self.inflight.lock())
            .into_iter()
            .collect();
        for key in keys {
            let Some(entry) = graph.get(&key) else {
                continue;
            };
            if entry.is_done() {
                // Can happen when the pool aborted between a commit and its
                // notify_done. The entry is complete, leave it alone.
                continue;
            }
            let temporary_deps = entry.temporary_direct_deps();
            tracing::debug!(
                "[evaluator] removing partially evaluated {key} ({} deps)",
                temporary_deps.len()
            );
            graph.remove(&key);
            for dep in temporary_deps {
                if let Some(dep_entry) = graph.get(&dep) {
                    dep_entry.remove_reverse_dep(&key);
                }
            }
        }
    }
}
