//! One iteration of a worker loop.
//!
//! The cycle is the only layer that decides between retrying, escalating to
//! a fault submission, or giving up. Everything below it reports outcomes
//! without acting on them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use super::{CycleOutcome, HEALTH_CACHE_TTL, RetryPolicy, WorkerStatus};
use crate::audit::{self, CsamTrigger};
use crate::backend::InferenceServer;
use crate::config::BridgeConfig;
use crate::error::{ConfigError, Result};
use crate::horde::{BRIDGE_AGENT, HordeClient, Job, JobPayload, PopRequest, SubmitRequest};
use crate::http::HttpClient;
use crate::moderation::{
    MODERATION_TIMEOUT, ModerationClassifier, ModerationDecision, ModerationFilter, ModerationMode,
    OpenAiModeration, PositiveAction,
};
use crate::poll::PollScheduler;
use crate::runtime::RuntimeState;
use crate::status::{JobResult, StatusBoard};
use crate::throttle::ThrottleCoordinator;

/// Keep budget used for trimming when a job omits its context length.
const TRIM_FALLBACK_CONTEXT: u32 = 2048;
/// Keep budget used for trimming when a job omits its output length.
const TRIM_FALLBACK_MAX_LENGTH: u32 = 256;

/// Shared dependencies for every job cycle.
#[derive(Clone)]
pub struct CycleDeps {
    pub config: Arc<BridgeConfig>,
    pub horde: HordeClient,
    pub server: InferenceServer,
    pub moderation: Arc<ModerationFilter>,
    pub throttle: Arc<ThrottleCoordinator>,
    pub scheduler: PollScheduler,
    pub status: Arc<StatusBoard>,
    pub retry: RetryPolicy,
}

impl CycleDeps {
    /// Wire up clients and coordinators from a validated config.
    pub fn from_config(
        config: Arc<BridgeConfig>,
        runtime: &RuntimeState,
        status: Arc<StatusBoard>,
    ) -> Result<Self> {
        let http = HttpClient::new(config.timeout);

        let horde = HordeClient::new(http.clone(), &config.cluster_url, &config.horde_api_key)
            .map_err(|e| ConfigError::invalid("AiHordeApiKey", e.to_string()))?;

        let server = InferenceServer::new(
            config.server_engine,
            &config.server_url,
            config.server_api_key.as_ref(),
            config.server_model.clone(),
            http.clone(),
        )
        .map_err(|e| ConfigError::invalid("serverApiKey", e.to_string()))?;

        let moderation_cfg = &config.moderation;
        let classifier: Option<Arc<dyn ModerationClassifier>> = match (
            moderation_cfg.mode,
            &moderation_cfg.api_key,
        ) {
            (ModerationMode::Remote, Some(key)) => Some(Arc::new(
                OpenAiModeration::new(http.with_timeout(MODERATION_TIMEOUT), &moderation_cfg.url, key)
                    .map_err(|e| ConfigError::invalid("openaiApiKey", e.to_string()))?,
            )),
            (ModerationMode::Remote, None) => {
                return Err(ConfigError::missing(
                    "openaiApiKey",
                    "Required when enableCsamFilter is openai.",
                )
                .into());
            }
            _ => None,
        };
        let moderation = ModerationFilter::new(
            moderation_cfg.mode,
            moderation_cfg.max_input_tokens,
            classifier,
        );

        let scheduler = PollScheduler::new(
            config.refresh_time,
            config.threads,
            config.thread_poll_stagger,
            runtime.epoch(),
        );

        Ok(Self {
            horde,
            server,
            moderation: Arc::new(moderation),
            throttle: Arc::new(ThrottleCoordinator::new(config.max_tps)),
            scheduler,
            status,
            retry: RetryPolicy::from_config(&config),
            config,
        })
    }
}

#[derive(Debug, Default)]
struct HealthCache {
    checked_at: Option<Instant>,
    healthy: bool,
}

enum PollResult {
    Job(Job),
    Empty,
    Maintenance,
    Exhausted,
}

/// Job cycle state for one worker.
pub struct JobCycle {
    worker_id: i64,
    deps: CycleDeps,
    health: HealthCache,
    pop_request: PopRequest,
}

impl JobCycle {
    pub fn new(worker_id: i64, deps: CycleDeps) -> Self {
        let config = &deps.config;
        let pop_request = PopRequest {
            name: config.worker_name.clone(),
            models: vec![config.model.clone()],
            nsfw: config.nsfw,
            max_length: config.max_length,
            max_context_length: config.ctx,
            priority_usernames: config.priority_usernames.clone(),
            threads: config.threads,
            softprompts: Vec::new(),
            bridge_agent: BRIDGE_AGENT.to_string(),
        };
        Self {
            worker_id,
            deps,
            health: HealthCache::default(),
            pop_request,
        }
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    pub fn deps(&self) -> &CycleDeps {
        &self.deps
    }

    fn config(&self) -> &BridgeConfig {
        &self.deps.config
    }

    fn interval(&self) -> Duration {
        self.deps.config.refresh_time
    }

    async fn set_status(&self, status: WorkerStatus, job_id: Option<&str>) {
        self.deps.status.set_status(self.worker_id, status, job_id).await;
    }

    async fn record_error(&self, message: impl Into<String>) {
        self.deps.status.record_error(self.worker_id, message).await;
    }

    /// Run one full cycle.
    pub async fn run(&mut self) -> CycleOutcome {
        self.deps.scheduler.wait_for_slot(self.worker_id).await;
        self.set_status(WorkerStatus::Polling, None).await;

        if !self.check_backend().await {
            self.set_status(WorkerStatus::Error, None).await;
            sleep(self.interval()).await;
            return CycleOutcome::Failure;
        }

        let job = match self.poll().await {
            PollResult::Job(job) => job,
            PollResult::Empty => return CycleOutcome::NoWork,
            PollResult::Maintenance => return CycleOutcome::Maintenance,
            PollResult::Exhausted => {
                self.set_status(WorkerStatus::Error, None).await;
                self.record_error("job pop failed after retries").await;
                return CycleOutcome::Failure;
            }
        };

        self.deps.status.job_started(self.worker_id, &job.id).await;
        let outcome = self.process(&job).await;
        self.deps.status.job_finished(&job.id).await;

        if !outcome.is_failure() {
            self.set_status(WorkerStatus::Idle, None).await;
        }
        outcome
    }

    /// Backend health, reusing a result younger than the cache TTL.
    pub async fn check_backend(&mut self) -> bool {
        if let Some(checked_at) = self.health.checked_at
            && checked_at.elapsed() <= HEALTH_CACHE_TTL
        {
            return self.health.healthy;
        }

        self.health.checked_at = Some(Instant::now());
        self.health.healthy = match self.deps.server.check_health().await {
            Ok(()) => true,
            Err(message) => {
                error!(
                    worker = self.worker_id,
                    url = %self.deps.server.health_url(),
                    error = %message,
                    "Backend health check failed"
                );
                self.record_error(message).await;
                false
            }
        };
        self.health.healthy
    }

    async fn poll(&self) -> PollResult {
        let interval = self.interval();

        for attempt in 1..=self.deps.retry.pop_attempts {
            let response = self.deps.horde.pop(&self.pop_request).await;

            if !response.ok {
                if response.is_worker_maintenance() {
                    let message = response
                        .data
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Worker in maintenance");
                    warn!(
                        worker = self.worker_id,
                        detail = message,
                        wait_ms = interval.as_millis() as u64,
                        "Worker in maintenance"
                    );
                    self.deps.status.set_maintenance(true).await;
                    self.set_status(WorkerStatus::Maintenance, None).await;
                    self.record_error("worker maintenance mode").await;
                    sleep(interval).await;
                    return PollResult::Maintenance;
                }

                self.deps.status.set_maintenance(false).await;
                self.set_status(WorkerStatus::RetryingPop, None).await;
                self.record_error(format!("pop attempt {attempt} failed: {}", response.describe()))
                    .await;
                sleep(interval).await;
                continue;
            }

            self.deps.status.set_maintenance(false).await;

            let Some(job) = Job::from_pop_response(&response.data) else {
                debug!(worker = self.worker_id, "No job available");
                self.set_status(WorkerStatus::Idle, None).await;
                sleep(interval).await;
                return PollResult::Empty;
            };

            info!(
                worker = self.worker_id,
                job_id = %job.id,
                max_length = job.payload.max_length,
                max_context_length = job.payload.max_context_length,
                "New job received"
            );
            self.set_status(WorkerStatus::Generating, Some(&job.id)).await;
            if let Some(path) = &self.config().output_prompt {
                audit::log_prompt(path, &job.id, &job.payload.prompt).await;
            }
            return PollResult::Job(job);
        }

        PollResult::Exhausted
    }

    async fn process(&self, job: &Job) -> CycleOutcome {
        let decision = self
            .deps
            .moderation
            .evaluate(&job.payload.prompt, &self.deps.server)
            .await;
        if decision.blocked {
            return self.resolve_block(job, &decision).await;
        }

        if self.config().enforce_ctx_limit
            && let Some(outcome) = self.check_context(job).await
        {
            return outcome;
        }

        let request = self.prepare_request(&job.payload).await;
        self.generate_and_submit(job, &request).await
    }

    /// Answer a blocked prompt with the safe response or a fault.
    async fn resolve_block(&self, job: &Job, decision: &ModerationDecision) -> CycleOutcome {
        let reason = decision.reason.map_or("csam", |r| r.as_str());
        let moderation = &self.config().moderation;

        self.deps.status.record_csam_trigger().await;
        if let Some(path) = &self.config().log_file {
            let trigger = CsamTrigger::new(
                &job.id,
                reason,
                decision.mode,
                decision.remote_score,
                &job.payload.prompt,
            );
            audit::log_csam_trigger(path, &trigger).await;
        }
        warn!(
            worker = self.worker_id,
            job_id = %job.id,
            reason,
            mode = %decision.mode,
            score = ?decision.remote_score,
            "Prompt blocked by moderation"
        );
        self.set_status(WorkerStatus::CsamBlock, Some(&job.id)).await;

        let submitted = match decision.action(moderation.positive_action) {
            PositiveAction::Respond => {
                let request = SubmitRequest::moderated(
                    &job.id,
                    &moderation.blocked_response,
                    &moderation.metadata_ref,
                );
                match self.submit(&request, true).await {
                    Some(reward) => {
                        let result = JobResult::sent(reward, 0, Duration::ZERO)
                            .with_status("csam_responded")
                            .with_moderation(decision.remote_score, decision.remote_flagged);
                        self.deps.status.record_job_result(&job.id, result).await;
                        true
                    }
                    None => {
                        self.submit_fault(&job.id, "csam_response_submit_failure", Some(decision))
                            .await
                    }
                }
            }
            PositiveAction::Fault => self.submit_fault(&job.id, reason, Some(decision)).await,
        };

        if submitted {
            CycleOutcome::Handled
        } else {
            CycleOutcome::Failure
        }
    }

    /// Reject prompts that cannot fit the configured context window.
    ///
    /// The budget is `ctx - max_length` from the operator's config and the
    /// job's requested output length. `None` means the prompt fits.
    async fn check_context(&self, job: &Job) -> Option<CycleOutcome> {
        let allowed = i64::from(self.config().ctx) - i64::from(job.payload.max_length);
        let prompt_tokens = self.deps.server.count_prompt_tokens(&job.payload.prompt).await as i64;

        if allowed > 0 && prompt_tokens <= allowed {
            return None;
        }

        let message = format!("ctx limit: prompt {prompt_tokens} > allowed {}", allowed.max(0));
        warn!(worker = self.worker_id, job_id = %job.id, prompt_tokens, allowed, "Prompt exceeds context limit");
        self.record_error(message).await;
        self.set_status(WorkerStatus::CtxLimit, Some(&job.id)).await;

        Some(if self.submit_fault(&job.id, "ctx_limit", None).await {
            CycleOutcome::Handled
        } else {
            CycleOutcome::Failure
        })
    }

    /// Backend request for a job, with the prompt trimmed when it overflows.
    async fn prepare_request(&self, payload: &JobPayload) -> Value {
        let mut request = self.deps.server.build_request(payload);
        if let Some(trimmed) = self.trim_prompt(payload).await
            && let Some(prompt) = request.get_mut("prompt")
        {
            *prompt = Value::String(trimmed);
        }
        request
    }

    /// Keep the head and tail halves of an overflowing prompt.
    ///
    /// Only for backends with exact tokenization. The budget comes from the
    /// job's own `max_context_length - max_length`.
    async fn trim_prompt(&self, payload: &JobPayload) -> Option<String> {
        let server = &self.deps.server;
        if !server.supports_tokenize() {
            return None;
        }
        let tokens = server.tokenize(&payload.prompt).await?;

        let context = match payload.max_context_length {
            0 => TRIM_FALLBACK_CONTEXT,
            n => n,
        };
        let max_length = match payload.max_length {
            0 => TRIM_FALLBACK_MAX_LENGTH,
            n => n,
        };
        let budget = i64::from(context) - i64::from(max_length);
        if budget <= 0 || tokens.len() as i64 <= budget {
            return None;
        }

        let half = (budget / 2) as usize;
        if half == 0 {
            return None;
        }
        let trimmed: Vec<i64> = tokens[..half]
            .iter()
            .chain(&tokens[tokens.len() - half..])
            .copied()
            .collect();

        let prompt = server.detokenize(&trimmed).await.filter(|p| !p.is_empty())?;
        info!(
            worker = self.worker_id,
            from_tokens = tokens.len(),
            to_tokens = trimmed.len(),
            "Trimmed prompt to fit context"
        );
        Some(prompt)
    }

    async fn generate_and_submit(&self, job: &Job, request: &Value) -> CycleOutcome {
        let server = &self.deps.server;
        let interval = self.interval();
        let started = Instant::now();

        for attempt in 1..=self.deps.retry.generation_attempts {
            let response = server.generate(request).await;
            if !response.ok {
                error!(
                    worker = self.worker_id,
                    job_id = %job.id,
                    attempt,
                    error = %response.describe(),
                    "Generation failed, will retry"
                );
                self.set_status(WorkerStatus::RetryingGeneration, Some(&job.id)).await;
                self.record_error(format!("generation retry {attempt} for {}", job.id)).await;
                sleep(interval).await;
                continue;
            }

            self.set_status(WorkerStatus::Submitting, Some(&job.id)).await;

            let generation = match server.extract_generation(&response.data, &job.payload.prompt) {
                Ok(generation) => generation,
                Err(e) => {
                    error!(worker = self.worker_id, job_id = %job.id, attempt, error = %e, "Generation parse error");
                    self.record_error(e.to_string()).await;
                    sleep(interval).await;
                    continue;
                }
            };

            let tokens = server
                .count_generation_tokens(&generation, job.payload.max_length)
                .await;
            let elapsed = started.elapsed();
            self.deps.throttle.reserve(tokens).await;

            let submit = SubmitRequest::generation(&job.id, generation);
            return match self.submit(&submit, false).await {
                Some(reward) => {
                    self.deps
                        .status
                        .record_job_result(&job.id, JobResult::sent(reward, tokens, elapsed))
                        .await;
                    CycleOutcome::Success
                }
                None => {
                    self.record_error(format!("submit failed for {}", job.id)).await;
                    self.set_status(WorkerStatus::SubmitFailed, Some(&job.id)).await;
                    self.submit_fault(&job.id, "submit_failure", None).await;
                    CycleOutcome::Failure
                }
            };
        }

        error!(worker = self.worker_id, job_id = %job.id, "Generation failed after retries");
        self.record_error(format!("generation failed for {}", job.id)).await;
        self.set_status(WorkerStatus::GenerationFailed, Some(&job.id)).await;
        self.submit_fault(&job.id, "generation_failure", None).await;
        CycleOutcome::Failure
    }

    /// Submit a result, returning the reward.
    ///
    /// A missing or non-finite reward is retried, or counted as zero when
    /// `allow_missing_reward` is set.
    async fn submit(&self, request: &SubmitRequest, allow_missing_reward: bool) -> Option<f64> {
        let retry = self.deps.retry;

        for attempt in 1..=retry.submit_attempts {
            let response = self.deps.horde.submit(request).await;

            if response.ok {
                match (reward_from(&response.data), allow_missing_reward) {
                    (Some(reward), _) => {
                        info!(
                            worker = self.worker_id,
                            job_id = %request.id,
                            reward = %format!("{reward:.2}"),
                            "Submitted generation"
                        );
                        return Some(reward);
                    }
                    (None, true) => {
                        info!(worker = self.worker_id, job_id = %request.id, "Submitted response without reward");
                        return Some(0.0);
                    }
                    (None, false) => {
                        error!(
                            worker = self.worker_id,
                            job_id = %request.id,
                            response = %response.data,
                            "Submit response has no usable reward"
                        );
                    }
                }
            } else {
                self.record_error(format!("submit retry {attempt} for {}", request.id)).await;
            }

            if attempt < retry.submit_attempts {
                sleep(retry.submit_backoff).await;
            }
        }

        None
    }

    /// Report a job as faulted. True once the cluster accepted the fault.
    ///
    /// The job is recorded on the status board under `reason`, or
    /// `<reason>_submit_failed` when every attempt was rejected.
    async fn submit_fault(
        &self,
        job_id: &str,
        reason: &str,
        moderation: Option<&ModerationDecision>,
    ) -> bool {
        let retry = self.deps.retry;
        let request = SubmitRequest::faulted(job_id);
        let result = JobResult::unrewarded(reason).with_moderation(
            moderation.and_then(|d| d.remote_score),
            moderation.and_then(|d| d.remote_flagged),
        );

        for attempt in 1..=retry.submit_attempts {
            let response = self.deps.horde.submit(&request).await;
            if response.ok {
                info!(worker = self.worker_id, job_id, reason, "Submitted faulted state");
                self.deps.status.record_job_result(job_id, result).await;
                return true;
            }
            self.record_error(format!("faulted submit retry {attempt} for {job_id}")).await;
            if attempt < retry.submit_attempts {
                sleep(retry.submit_backoff).await;
            }
        }

        error!(worker = self.worker_id, job_id, reason, "Failed to submit faulted state");
        self.record_error(format!("failed faulted submit for {job_id} ({reason})")).await;
        self.deps
            .status
            .record_job_result(job_id, result.with_status(format!("{reason}_submit_failed")))
            .await;
        false
    }
}

/// Reward from a submit response; numeric strings are accepted.
fn reward_from(data: &Value) -> Option<f64> {
    let reward = match data.get("reward")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    reward.is_finite().then_some(reward)
}
