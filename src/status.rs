//! Status board: what every worker is doing and what the pool has achieved.
//!
//! Workers write their own entries; the periodic reporter and tests read
//! snapshots.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::worker::state::{WorkerState, WorkerStatus};

/// Interval of the summary log line.
pub const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);
/// How many finished jobs the board remembers.
pub const RECENT_JOBS_LIMIT: usize = 7;

/// Aggregate counters for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub jobs_received: u64,
    /// Jobs answered with a rewarded submission.
    pub jobs_processed: u64,
    pub kudos: f64,
    pub tokens: u64,
    pub generation_time: Duration,
    pub csam_triggers: u64,
}

impl PoolStats {
    /// Generated tokens per second of generation time.
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.generation_time.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Most recent failure reported by any worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub worker: i64,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A claimed job that has not been resolved yet.
#[derive(Debug, Clone, Serialize)]
pub struct InFlightJob {
    pub worker: i64,
    pub started_at: DateTime<Utc>,
}

/// How a claimed job ended.
///
/// `status` is `sent`, `csam_responded` or the fault reason. Only results
/// carrying a reward count as processed.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub status: String,
    pub reward: Option<f64>,
    pub tokens: usize,
    pub elapsed: Duration,
    pub csam_score: Option<f64>,
    pub openai_flagged: Option<bool>,
}

impl JobResult {
    /// A rewarded generation.
    pub fn sent(reward: f64, tokens: usize, elapsed: Duration) -> Self {
        Self {
            status: "sent".to_string(),
            reward: Some(reward),
            tokens,
            elapsed,
            csam_score: None,
            openai_flagged: None,
        }
    }

    /// A job resolved without a reward, e.g. a fault.
    pub fn unrewarded(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            reward: None,
            tokens: 0,
            elapsed: Duration::ZERO,
            csam_score: None,
            openai_flagged: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_moderation(mut self, csam_score: Option<f64>, openai_flagged: Option<bool>) -> Self {
        self.csam_score = csam_score;
        self.openai_flagged = openai_flagged;
        self
    }
}

/// Entry of the recent jobs list, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentJob {
    pub id: String,
    pub status: String,
    pub kudos: Option<f64>,
    pub tokens: Option<usize>,
    pub tps: Option<f64>,
    pub csam_score: Option<f64>,
    pub openai_flagged: Option<bool>,
    /// Claim to resolution, when the claim was seen.
    pub duration: Option<Duration>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub workers: Vec<WorkerState>,
    pub in_flight: HashMap<String, InFlightJob>,
    pub stats: PoolStats,
    pub recent_jobs: Vec<RecentJob>,
    pub last_error: Option<LastError>,
    pub maintenance: bool,
}

#[derive(Debug, Default)]
struct Board {
    workers: BTreeMap<i64, WorkerState>,
    in_flight: HashMap<String, InFlightJob>,
    stats: PoolStats,
    recent_jobs: VecDeque<RecentJob>,
    last_error: Option<LastError>,
    maintenance: bool,
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    board: RwLock<Board>,
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a status change for a worker, creating its entry on first use.
    pub async fn set_status(&self, worker: i64, status: WorkerStatus, job_id: Option<&str>) {
        let mut board = self.board.write().await;
        let state = board.workers.entry(worker).or_insert_with(|| WorkerState::new(worker));
        if state.status != status {
            debug!(worker, from = %state.status, to = %status, "Worker status changed");
        }
        state.transition(status, job_id.map(str::to_string));
    }

    pub async fn worker(&self, worker: i64) -> Option<WorkerState> {
        self.board.read().await.workers.get(&worker).cloned()
    }

    pub async fn job_started(&self, worker: i64, job_id: &str) {
        let mut board = self.board.write().await;
        board.stats.jobs_received += 1;
        board.in_flight.insert(
            job_id.to_string(),
            InFlightJob {
                worker,
                started_at: Utc::now(),
            },
        );
    }

    pub async fn job_finished(&self, job_id: &str) {
        self.board.write().await.in_flight.remove(job_id);
    }

    /// Drop every in-flight job of a worker whose cycle died. Returns the ids.
    pub async fn abandon_jobs(&self, worker: i64) -> Vec<String> {
        let mut board = self.board.write().await;
        let ids: Vec<String> = board
            .in_flight
            .iter()
            .filter(|(_, job)| job.worker == worker)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            board.in_flight.remove(id);
        }
        ids
    }

    pub async fn in_flight_count(&self) -> usize {
        self.board.read().await.in_flight.len()
    }

    /// Record how a job ended and push it onto the recent jobs list.
    pub async fn record_job_result(&self, job_id: &str, result: JobResult) {
        let now = Utc::now();
        let mut board = self.board.write().await;

        let duration = board
            .in_flight
            .get(job_id)
            .and_then(|job| (now - job.started_at).to_std().ok());
        let secs = result.elapsed.as_secs_f64();
        let tps = (result.tokens > 0 && secs > 0.0).then(|| result.tokens as f64 / secs);

        if let Some(reward) = result.reward {
            let stats = &mut board.stats;
            stats.jobs_processed += 1;
            stats.kudos += reward;
            stats.tokens += result.tokens as u64;
            stats.generation_time += result.elapsed;
        }

        board.recent_jobs.push_front(RecentJob {
            id: job_id.to_string(),
            status: result.status,
            kudos: result.reward,
            tokens: result.reward.map(|_| result.tokens),
            tps,
            csam_score: result.csam_score,
            openai_flagged: result.openai_flagged,
            duration,
            finished_at: now,
        });
        board.recent_jobs.truncate(RECENT_JOBS_LIMIT);
    }

    pub async fn recent_jobs(&self) -> Vec<RecentJob> {
        self.board.read().await.recent_jobs.iter().cloned().collect()
    }

    pub async fn record_csam_trigger(&self) {
        self.board.write().await.stats.csam_triggers += 1;
    }

    pub async fn record_error(&self, worker: i64, message: impl Into<String>) {
        let message = message.into();
        warn!(worker, error = %message, "Worker error");
        self.board.write().await.last_error = Some(LastError {
            worker,
            message,
            at: Utc::now(),
        });
    }

    pub async fn set_maintenance(&self, maintenance: bool) {
        let mut board = self.board.write().await;
        if board.maintenance != maintenance {
            info!(maintenance, "Cluster maintenance state changed");
        }
        board.maintenance = maintenance;
    }

    pub async fn stats(&self) -> PoolStats {
        self.board.read().await.stats.clone()
    }

    pub async fn last_error(&self) -> Option<LastError> {
        self.board.read().await.last_error.clone()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let board = self.board.read().await;
        StatusSnapshot {
            workers: board.workers.values().cloned().collect(),
            in_flight: board.in_flight.clone(),
            stats: board.stats.clone(),
            recent_jobs: board.recent_jobs.iter().cloned().collect(),
            last_error: board.last_error.clone(),
            maintenance: board.maintenance,
        }
    }

    /// Emit one summary log line.
    pub async fn log_summary(&self) {
        let snapshot = self.snapshot().await;
        let busy = snapshot
            .workers
            .iter()
            .filter(|w| w.id >= 0 && w.status.is_busy())
            .count();
        let problems = snapshot
            .workers
            .iter()
            .filter(|w| w.id >= 0 && w.status.is_problem())
            .count();
        info!(
            received = snapshot.stats.jobs_received,
            jobs = snapshot.stats.jobs_processed,
            kudos = %format!("{:.2}", snapshot.stats.kudos),
            tokens = snapshot.stats.tokens,
            tps = %format!("{:.2}", snapshot.stats.tokens_per_second()),
            csam_triggers = snapshot.stats.csam_triggers,
            busy,
            problems,
            last_job = snapshot.recent_jobs.first().map(|j| j.status.as_str()).unwrap_or("-"),
            in_flight = snapshot.in_flight.len(),
            maintenance = snapshot.maintenance,
            "Worker summary"
        );
    }
}

/// Spawn a background task that logs a summary every `interval`.
pub fn spawn_status_reporter(
    board: Arc<StatusBoard>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; nothing to report yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            board.log_summary().await;
        }
    })
}
