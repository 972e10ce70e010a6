//! Worker loops and the circuit breaker.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CycleDeps, CycleOutcome, JobCycle, WorkerStatus};
use crate::error::CycleError;
use crate::runtime::RuntimeState;
use crate::status::StatusBoard;

/// Id of the pre-flight health probe. Negative ids never stagger.
pub const PROBE_WORKER_ID: i64 = -1;

/// One unit of work repeated by a worker loop.
#[async_trait]
pub trait WorkerCycle: Send {
    fn worker_id(&self) -> i64;

    fn status_board(&self) -> Arc<StatusBoard>;

    async fn run(&mut self) -> CycleOutcome;
}

#[async_trait]
impl WorkerCycle for JobCycle {
    fn worker_id(&self) -> i64 {
        JobCycle::worker_id(self)
    }

    fn status_board(&self) -> Arc<StatusBoard> {
        self.deps().status.clone()
    }

    async fn run(&mut self) -> CycleOutcome {
        JobCycle::run(self).await
    }
}

/// Loop cycles until the runtime stops or shutdown is requested.
///
/// A panicking cycle is logged and counted as a failure; the loop keeps going.
pub async fn run_worker<C: WorkerCycle>(mut cycle: C, runtime: Arc<RuntimeState>) {
    let worker = cycle.worker_id();
    let status = cycle.status_board();
    info!(worker, "Worker started");

    while runtime.should_continue() {
        let outcome = match AssertUnwindSafe(cycle.run()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let err = CycleError::Panicked {
                    worker,
                    reason: panic_message(panic.as_ref()),
                };
                error!(worker, error = %err, "Cycle aborted");
                let abandoned = status.abandon_jobs(worker).await;
                if !abandoned.is_empty() {
                    warn!(worker, jobs = ?abandoned, "Dropped in-flight jobs of aborted cycle");
                }
                status.set_status(worker, WorkerStatus::Error, None).await;
                status.record_error(worker, err.to_string()).await;
                CycleOutcome::Failure
            }
        };
        debug!(worker, outcome = %outcome, "Cycle finished");
        runtime.record_outcome(outcome);
    }

    if runtime.is_shutdown_requested() {
        info!(worker, "Worker stopped on shutdown request");
    } else {
        info!(worker, "Worker stopped by circuit breaker");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The steady-state workers plus the pre-flight probe.
pub struct WorkerPool {
    deps: CycleDeps,
    runtime: Arc<RuntimeState>,
}

impl WorkerPool {
    pub fn new(deps: CycleDeps, runtime: Arc<RuntimeState>) -> Self {
        Self { deps, runtime }
    }

    /// Check the backend once before any worker starts.
    pub async fn preflight(&self) -> bool {
        let mut probe = JobCycle::new(PROBE_WORKER_ID, self.deps.clone());
        let healthy = probe.check_backend().await;
        let status = if healthy {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Error
        };
        self.deps.status.set_status(PROBE_WORKER_ID, status, None).await;
        healthy
    }

    /// Spawn one task per configured thread.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        (0..self.deps.config.threads)
            .map(|id| {
                let cycle = JobCycle::new(i64::from(id), self.deps.clone());
                tokio::spawn(run_worker(cycle, self.runtime.clone()))
            })
            .collect()
    }

    /// Spawn all workers and wait for every loop to exit.
    pub async fn run(&self) {
        let handles = self.spawn();
        info!(workers = handles.len(), "Workers running");
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(
            failures = self.runtime.consecutive_failures(),
            "All workers stopped"
        );
    }
}
