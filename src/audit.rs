//! Append-only audit files. Writes are best effort and never fail a cycle.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::moderation::ModerationMode;

/// One moderation block, serialized as a JSON line.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsamTrigger<'a> {
    pub ts: String,
    pub event: &'static str,
    pub job_id: &'a str,
    pub reason: &'a str,
    pub mode: ModerationMode,
    pub threshold: Option<f64>,
    pub openai_minor_score: Option<f64>,
    pub prompt_length: usize,
    pub prompt: &'a str,
}

impl<'a> CsamTrigger<'a> {
    pub fn new(
        job_id: &'a str,
        reason: &'a str,
        mode: ModerationMode,
        score: Option<f64>,
        prompt: &'a str,
    ) -> Self {
        Self {
            ts: timestamp(),
            event: "CSAM_TRIGGER",
            job_id,
            reason,
            mode,
            threshold: None,
            openai_minor_score: score,
            prompt_length: prompt.chars().count(),
            prompt,
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn append(path: &Path, entry: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(entry.as_bytes()).await?;
    file.flush().await
}

/// Append a claimed prompt as `[ts] job=<id>\n<prompt>\n\n`.
pub async fn log_prompt(path: &Path, job_id: &str, prompt: &str) {
    let entry = format!("[{}] job={job_id}\n{prompt}\n\n", timestamp());
    if let Err(e) = append(path, &entry).await {
        error!(path = %path.display(), error = %e, "Failed writing prompt log");
    }
}

/// Append a moderation block to the JSON-lines audit log.
pub async fn log_csam_trigger(path: &Path, trigger: &CsamTrigger<'_>) {
    let line = match serde_json::to_string(trigger) {
        Ok(line) => line + "\n",
        Err(e) => {
            debug!(error = %e, "Failed to serialize moderation audit entry");
            return;
        }
    };
    if let Err(e) = append(path, &line).await {
        debug!(path = %path.display(), error = %e, "Failed writing moderation audit entry");
    }
}
