//! Process-wide run state shared by every worker.

use std::sync::Mutex;

use tokio::time::Instant;
use tracing::{error, info};

use crate::worker::CycleOutcome;

#[derive(Debug)]
struct Inner {
    running: bool,
    shutdown_requested: bool,
    consecutive_failures: u32,
}

/// Running flag, graceful-shutdown flag and consecutive-failure counter,
/// all behind one lock, plus the fixed poll epoch.
#[derive(Debug)]
pub struct RuntimeState {
    inner: Mutex<Inner>,
    max_failures: u32,
    epoch: Instant,
}

impl RuntimeState {
    pub fn new(max_failures: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                running: true,
                shutdown_requested: false,
                consecutive_failures: 0,
            }),
            max_failures: max_failures.max(1),
            epoch: Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked; every update is a single assignment.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// True while workers should start new cycles.
    pub fn should_continue(&self) -> bool {
        let inner = self.lock();
        inner.running && !inner.shutdown_requested
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.lock().shutdown_requested
    }

    /// Ask workers to finish their current cycle and exit.
    pub fn request_shutdown(&self) {
        self.lock().shutdown_requested = true;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Apply one cycle outcome to the circuit breaker.
    ///
    /// Returns true if this outcome tripped the breaker.
    pub fn record_outcome(&self, outcome: CycleOutcome) -> bool {
        let mut inner = self.lock();
        if !outcome.is_failure() {
            inner.consecutive_failures = 0;
            return false;
        }

        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.max_failures && inner.running {
            inner.running = false;
            error!(
                failures = inner.consecutive_failures,
                "Too many consecutive failed requests, stopping workers"
            );
            return true;
        }
        if inner.running {
            info!(
                failures = inner.consecutive_failures,
                max = self.max_failures,
                "Cycle failed"
            );
        }
        false
    }
}
