//! Poll staggering across workers.
//!
//! The refresh interval `R` is split into one slot per worker; worker `i`
//! claims near `i * R / N` past the shared epoch, modulo `R`.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

/// Waits shorter than this are not worth scheduling.
const MIN_STAGGER_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PollScheduler {
    refresh: Duration,
    workers: u32,
    enabled: bool,
    epoch: Instant,
}

impl PollScheduler {
    pub fn new(refresh: Duration, workers: u32, enabled: bool, epoch: Instant) -> Self {
        Self {
            refresh,
            workers,
            enabled,
            epoch,
        }
    }

    /// Staggering does nothing with a single worker or a zero interval.
    pub fn is_active(&self) -> bool {
        self.enabled && self.workers > 1 && !self.refresh.is_zero()
    }

    /// Phase offset of a worker within the refresh interval.
    pub fn phase_offset(&self, worker_id: i64) -> Duration {
        if self.workers == 0 || worker_id < 0 {
            return Duration::ZERO;
        }
        let slot = self.refresh / self.workers;
        slot * (worker_id as u64 % u64::from(self.workers)) as u32
    }

    /// Delay from a point `elapsed` past the epoch until the worker's next phase.
    pub fn delay_for(&self, worker_id: i64, elapsed: Duration) -> Duration {
        if !self.is_active() || worker_id < 0 {
            return Duration::ZERO;
        }
        let refresh = self.refresh.as_nanos();
        let position = elapsed.as_nanos() % refresh;
        let phase = self.phase_offset(worker_id).as_nanos();
        let wait = if phase >= position {
            phase - position
        } else {
            phase + refresh - position
        };
        Duration::from_nanos(wait as u64)
    }

    /// Sleep until this worker's slot. Probe workers (negative ids) never wait.
    pub async fn wait_for_slot(&self, worker_id: i64) {
        let wait = self.delay_for(worker_id, self.epoch.elapsed());
        if wait < MIN_STAGGER_WAIT {
            return;
        }
        debug!(worker = worker_id, wait_ms = wait.as_millis() as u64, "Staggering poll");
        sleep(wait).await;
    }
}
