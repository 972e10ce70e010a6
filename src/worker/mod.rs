//! Worker system: one job cycle per loop iteration, N loops behind a
//! shared circuit breaker.
//!
//! - `state`: per-worker status model
//! - `cycle`: poll → moderate → ctx-check → generate → throttle → submit
//! - `pool`: run loop, panic isolation and worker spawning

pub mod cycle;
pub mod pool;
pub mod state;

use std::time::Duration;

use crate::config::BridgeConfig;

pub use cycle::{CycleDeps, JobCycle};
pub use pool::{PROBE_WORKER_ID, WorkerCycle, WorkerPool, run_worker};
pub use state::{WorkerState, WorkerStatus};

pub const MAX_POP_RETRIES: u32 = 3;
pub const MAX_GENERATION_RETRIES: u32 = 3;
pub const MAX_SUBMIT_RETRIES: u32 = 5;
/// Default circuit breaker threshold.
pub const MAX_FAILED_REQUESTS: u32 = 6;
pub const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(10);
/// How long a backend health result is reused.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// How a cycle ended. Only `Failure` counts against the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A generation was submitted and rewarded.
    Success,
    /// The cluster had nothing for us.
    NoWork,
    /// The cluster has paused this worker.
    Maintenance,
    /// The job was resolved without generating (moderation block or ctx limit).
    Handled,
    Failure,
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::NoWork => "no_work",
            Self::Maintenance => "maintenance",
            Self::Handled => "handled",
            Self::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

/// Attempt bounds and backoff for the retrying stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub pop_attempts: u32,
    pub generation_attempts: u32,
    pub submit_attempts: u32,
    pub submit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            pop_attempts: MAX_POP_RETRIES,
            generation_attempts: MAX_GENERATION_RETRIES,
            submit_attempts: MAX_SUBMIT_RETRIES,
            submit_backoff: SUBMIT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            submit_backoff: config.submit_retry_delay,
            ..Self::default()
        }
    }
}
