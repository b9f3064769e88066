//! Runtime tunables, generalized from the teacher's `Args`-derived knobs.
//! Defaults follow spec.md's stated defaults throughout.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub correlation_ttl: Duration,
    pub correlation_max_depth: usize,
    pub correlation_max_entries: usize,
    pub watch_reconcile_interval: Duration,
    pub worker_max_commits: usize,
    pub worker_max_batch_bytes: usize,
    pub worker_push_interval: Duration,
    pub worker_max_retries: u32,
    pub worker_queue_high_water_mark: usize,
    pub leader: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            correlation_ttl: Duration::from_secs(60),
            correlation_max_depth: 10,
            correlation_max_entries: 10_000,
            watch_reconcile_interval: Duration::from_secs(30),
            worker_max_commits: 20,
            worker_max_batch_bytes: 1024 * 1024,
            worker_push_interval: Duration::from_secs(60),
            worker_max_retries: 3,
            worker_queue_high_water_mark: 1_000,
            leader: true,
        }
    }
}
