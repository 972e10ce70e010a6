//! Worker status model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    /// Between cycles or waiting for its poll slot.
    Idle,
    /// Claiming a job.
    Polling,
    /// Moderating, checking context or generating.
    Generating,
    /// Submitting a result or fault.
    Submitting,
    RetryingPop,
    RetryingGeneration,
    /// The cluster has paused this worker.
    Maintenance,
    /// Last job was blocked by moderation.
    CsamBlock,
    /// Last job exceeded the context limit.
    CtxLimit,
    SubmitFailed,
    GenerationFailed,
    /// Backend unhealthy, claim exhausted or internal fault.
    Error,
}

impl WorkerStatus {
    /// Statuses that report a failed or rejected job.
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            Self::CsamBlock | Self::CtxLimit | Self::SubmitFailed | Self::GenerationFailed | Self::Error
        )
    }

    /// Statuses with a job in hand.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Generating | Self::Submitting | Self::RetryingGeneration
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Generating => "generating",
            Self::Submitting => "submitting",
            Self::RetryingPop => "retrying-pop",
            Self::RetryingGeneration => "retrying-generation",
            Self::Maintenance => "maintenance",
            Self::CsamBlock => "csam-block",
            Self::CtxLimit => "ctx-limit",
            Self::SubmitFailed => "submit-failed",
            Self::GenerationFailed => "generation-failed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: i64,
    pub status: WorkerStatus,
    pub job_id: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl WorkerState {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            job_id: None,
            changed_at: Utc::now(),
        }
    }

    /// Move to a new status. The job id is replaced, not merged.
    pub fn transition(&mut self, status: WorkerStatus, job_id: Option<String>) {
        self.status = status;
        self.job_id = job_id;
        self.changed_at = Utc::now();
    }
}
