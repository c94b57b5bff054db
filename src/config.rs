use serde::{Deserialize, Serialize};

/// Evaluation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Continue past node failures. Failed nodes store their error, parents
    /// are still signaled, and unrelated roots may still succeed. When
    /// false, the first failure halts the evaluation and bubbles to a
    /// requested root.
    #[serde(default)]
    pub keep_going: bool,

    /// Worker threads in the evaluation pool.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Cap on the number of cycles reported per root.
    #[serde(default = "default_max_cycles")]
    pub max_cycles_reported: usize,
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_cycles() -> usize {
    20
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            keep_going: false,
            thread_count: default_thread_count(),
            max_cycles_reported: default_max_cycles(),
        }
    }
}
