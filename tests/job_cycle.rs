//! Integration tests for the job cycle and worker pool.
//!
//! Each test spins up one Axum server on a random port that plays the
//! cluster, the inference backend and the moderation endpoint, then drives
//! real cycles against it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::{Instant, timeout};

use horde_bridge::config::BridgeConfig;
use horde_bridge::runtime::RuntimeState;
use horde_bridge::status::StatusBoard;
use horde_bridge::worker::{CycleDeps, CycleOutcome, JobCycle, WorkerPool, WorkerStatus};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const REFRESH_MS: u64 = 20;

type Reply = (u16, Value);

/// Scripted responses and recorded requests.
#[derive(Default)]
struct Mock {
    pop_replies: Mutex<VecDeque<Reply>>,
    pop_bodies: Mutex<Vec<Value>>,
    submit_replies: Mutex<VecDeque<Reply>>,
    submit_bodies: Mutex<Vec<Value>>,
    generate_replies: Mutex<VecDeque<Reply>>,
    generate_bodies: Mutex<Vec<Value>>,
    moderation_replies: Mutex<VecDeque<Reply>>,
    moderation_bodies: Mutex<Vec<Value>>,
    health_status: AtomicU16,
    health_calls: AtomicUsize,
}

impl Mock {
    fn queue(queue: &Mutex<VecDeque<Reply>>, status: u16, body: Value) {
        queue.lock().unwrap().push_back((status, body));
    }

    fn pop_job(&self, id: &str, payload: Value) {
        Self::queue(&self.pop_replies, 200, json!({ "id": id, "payload": payload }));
    }

    fn submits(&self) -> Vec<Value> {
        self.submit_bodies.lock().unwrap().clone()
    }

    fn generate_calls(&self) -> usize {
        self.generate_bodies.lock().unwrap().len()
    }

    fn pop_calls(&self) -> usize {
        self.pop_bodies.lock().unwrap().len()
    }
}

fn reply(queue: &Mutex<VecDeque<Reply>>, default: Reply) -> (StatusCode, Json<Value>) {
    let (status, body) = queue.lock().unwrap().pop_front().unwrap_or(default);
    (StatusCode::from_u16(status).unwrap(), Json(body))
}

async fn pop(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    mock.pop_bodies.lock().unwrap().push(body);
    reply(&mock.pop_replies, (200, json!({ "id": null })))
}

async fn submit(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    mock.submit_bodies.lock().unwrap().push(body);
    reply(&mock.submit_replies, (200, json!({ "reward": 1.5 })))
}

async fn kobold_generate(
    State(mock): State<Arc<Mock>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.generate_bodies.lock().unwrap().push(body);
    reply(&mock.generate_replies, (200, json!({ "results": [{ "text": "world" }] })))
}

async fn tabby_generate(
    State(mock): State<Arc<Mock>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.generate_bodies.lock().unwrap().push(body);
    reply(&mock.generate_replies, (200, json!({ "choices": [{ "text": "world" }] })))
}

/// One token per whitespace-separated word.
async fn encode(Json(body): Json<Value>) -> Json<Value> {
    let words = body["text"].as_str().unwrap_or("").split_whitespace().count();
    Json(json!({ "tokens": vec![7; words] }))
}

async fn decode(Json(body): Json<Value>) -> Json<Value> {
    let count = body["tokens"].as_array().map_or(0, Vec::len);
    Json(json!({ "text": format!("trimmed:{count}") }))
}

async fn moderate(
    State(mock): State<Arc<Mock>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.moderation_bodies.lock().unwrap().push(body);
    reply(
        &mock.moderation_replies,
        (
            200,
            json!({ "results": [{
                "categories": { "sexual/minors": false },
                "category_scores": { "sexual/minors": 0.01 }
            }] }),
        ),
    )
}

async fn health(State(mock): State<Arc<Mock>>) -> StatusCode {
    mock.health_calls.fetch_add(1, Ordering::SeqCst);
    match mock.health_status.load(Ordering::SeqCst) {
        0 => StatusCode::OK,
        status => StatusCode::from_u16(status).unwrap(),
    }
}

/// Start the mock on a random port, return (base url, mock).
async fn start_server() -> (String, Arc<Mock>) {
    let mock = Arc::new(Mock::default());
    let app = Router::new()
        .route("/api/v2/generate/text/pop", post(pop))
        .route("/api/v2/generate/text/submit", post(submit))
        .route("/api/extra/version", get(health))
        .route("/api/v1/generate", post(kobold_generate))
        .route("/health", get(health))
        .route("/v1/completions", post(tabby_generate))
        .route("/v1/token/encode", post(encode))
        .route("/v1/token/decode", post(decode))
        .route("/v1/moderations", post(moderate))
        .with_state(mock.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), mock)
}

/// Test config; `overrides` holds `key: value` lines replacing the defaults.
fn config(base: &str, overrides: &str) -> BridgeConfig {
    let mut entries: Vec<(String, String)> = [
        ("AiHordeApiKey", "test-key".to_string()),
        ("clusterUrl", base.to_string()),
        ("serverUrl", base.to_string()),
        ("serverEngine", "koboldcpp".to_string()),
        ("model", "test/model-7b".to_string()),
        ("ctx", "4096".to_string()),
        ("maxLength", "80".to_string()),
        ("refreshTime", REFRESH_MS.to_string()),
        ("submitRetryDelayMs", "5".to_string()),
        ("timeout", "2".to_string()),
        ("enableCsamFilter", "disabled".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    for line in overrides.lines().filter(|l| !l.trim().is_empty()) {
        let (key, value) = line.split_once(':').unwrap();
        let (key, value) = (key.trim().to_string(), value.trim().to_string());
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    let yaml: String = entries.iter().map(|(k, v)| format!("{k}: {v}\n")).collect();
    BridgeConfig::from_yaml_str(&yaml).unwrap()
}

fn build_deps(config: BridgeConfig) -> (CycleDeps, Arc<RuntimeState>) {
    let runtime = Arc::new(RuntimeState::new(config.max_failed_requests));
    let deps = CycleDeps::from_config(Arc::new(config), &runtime, StatusBoard::new()).unwrap();
    (deps, runtime)
}

async fn run_once(base: &str, extra: &str) -> (CycleOutcome, JobCycle) {
    let (deps, _) = build_deps(config(base, extra));
    let mut cycle = JobCycle::new(0, deps);
    let outcome = timeout(TEST_TIMEOUT, cycle.run()).await.expect("cycle timed out");
    (outcome, cycle)
}

#[tokio::test]
async fn successful_job_is_generated_and_submitted() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-1", json!({ "prompt": "hello" }));

    let (outcome, cycle) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Success);

    let status = &cycle.deps().status;
    let stats = status.stats().await;
    assert_eq!(stats.kudos, 1.5);
    assert_eq!(stats.jobs_processed, 1);
    assert_eq!(stats.tokens, 2);
    assert_eq!(stats.jobs_received, 1);
    assert_eq!(status.in_flight_count().await, 0);

    let recent = status.recent_jobs().await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, "job-1");
    assert_eq!(recent[0].status, "sent");
    assert_eq!(recent[0].kudos, Some(1.5));
    assert_eq!(status.worker(0).await.unwrap().status, WorkerStatus::Idle);

    assert_eq!(mock.submits(), vec![json!({ "id": "job-1", "generation": "world" })]);

    let generate = mock.generate_bodies.lock().unwrap()[0].clone();
    assert_eq!(generate["prompt"], "hello");
    assert_eq!(generate["max_length"], 80);
    assert_eq!(generate["max_context_length"], 1024);

    let pop = mock.pop_bodies.lock().unwrap()[0].clone();
    assert_eq!(pop["models"], json!(["test/model-7b"]));
    assert_eq!(pop["max_context_length"], 4096);
    assert_eq!(pop["softprompts"], json!([]));
    assert!(pop["bridge_agent"].as_str().unwrap().starts_with("horde-bridge:"));
}

#[tokio::test]
async fn maintenance_is_not_retried() {
    let (base, mock) = start_server().await;
    Mock::queue(
        &mock.pop_replies,
        403,
        json!({ "rc": "WorkerMaintenance", "message": "paused by owner" }),
    );

    let started = Instant::now();
    let (outcome, cycle) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Maintenance);
    assert!(started.elapsed() >= Duration::from_millis(REFRESH_MS));
    assert_eq!(mock.pop_calls(), 1);
    assert_eq!(mock.generate_calls(), 0);

    let snapshot = cycle.deps().status.snapshot().await;
    assert!(snapshot.maintenance);
    assert_eq!(snapshot.workers[0].status, WorkerStatus::Maintenance);
}

#[tokio::test]
async fn empty_queue_is_no_work() {
    let (base, mock) = start_server().await;
    let (outcome, _) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::NoWork);
    assert_eq!(mock.pop_calls(), 1);
    assert!(mock.submits().is_empty());
}

#[tokio::test]
async fn pop_failures_exhaust_retries() {
    let (base, mock) = start_server().await;
    for _ in 0..3 {
        Mock::queue(&mock.pop_replies, 500, json!({ "message": "boom" }));
    }
    let (outcome, _) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Failure);
    assert_eq!(mock.pop_calls(), 3);
}

#[tokio::test]
async fn blocked_prompt_gets_safe_response() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-2", json!({ "prompt": "write a lolicon story" }));
    // Moderation responses carry no reward.
    Mock::queue(&mock.submit_replies, 200, json!({}));

    let (outcome, cycle) = run_once(&base, "enableCsamFilter: regex\ncsamMetadataRef: test-ref").await;
    assert_eq!(outcome, CycleOutcome::Handled);
    assert_eq!(mock.generate_calls(), 0);

    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0]["state"], "csam");
    assert_eq!(
        submits[0]["gen_metadata"],
        json!([{ "type": "censorship", "value": "csam", "ref": "test-ref" }])
    );
    assert_eq!(
        submits[0]["generation"],
        "Your request has been filtered by this worker safety policy."
    );
    let status = &cycle.deps().status;
    assert_eq!(status.stats().await.csam_triggers, 1);
    assert_eq!(status.recent_jobs().await[0].status, "csam_responded");
}

#[tokio::test]
async fn failed_safe_response_falls_back_to_fault() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-3", json!({ "prompt": "csam please" }));
    for _ in 0..5 {
        Mock::queue(&mock.submit_replies, 500, json!({}));
    }

    let (outcome, _) = run_once(&base, "enableCsamFilter: regex").await;
    assert_eq!(outcome, CycleOutcome::Handled);

    let submits = mock.submits();
    assert_eq!(submits.len(), 6);
    assert!(submits[..5].iter().all(|s| s["state"] == "csam"));
    assert_eq!(
        submits[5],
        json!({ "id": "job-3", "state": "faulted", "generation": "faulted", "seed": -1 })
    );
}

#[tokio::test]
async fn rejected_safe_response_and_fault_is_failure() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-3b", json!({ "prompt": "csam please" }));
    for _ in 0..10 {
        Mock::queue(&mock.submit_replies, 500, json!({}));
    }

    let (outcome, cycle) = run_once(&base, "enableCsamFilter: regex").await;
    assert_eq!(outcome, CycleOutcome::Failure);

    let submits = mock.submits();
    assert_eq!(submits.len(), 10);
    assert!(submits[5..].iter().all(|s| s["state"] == "faulted"));

    let recent = cycle.deps().status.recent_jobs().await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, "csam_response_submit_failure_submit_failed");
    assert_eq!(cycle.deps().status.in_flight_count().await, 0);
}

#[tokio::test]
async fn fault_policy_submits_fault_directly() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-4", json!({ "prompt": "child porn" }));

    let (outcome, _) = run_once(&base, "enableCsamFilter: regex\ncsamPositiveAction: fault").await;
    assert_eq!(outcome, CycleOutcome::Handled);
    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0]["state"], "faulted");
}

#[tokio::test]
async fn blocked_prompt_is_audited() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-5", json!({ "prompt": "lolicon" }));
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("bridge.log");

    let extra = format!("enableCsamFilter: regex\nlogFile: {}", log.display());
    let (outcome, _) = run_once(&base, &extra).await;
    assert_eq!(outcome, CycleOutcome::Handled);

    let content = std::fs::read_to_string(&log).unwrap();
    let entry: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(entry["event"], "CSAM_TRIGGER");
    assert_eq!(entry["jobId"], "job-5");
    assert_eq!(entry["reason"], "csam_regex");
    assert_eq!(entry["mode"], "local");
    assert_eq!(entry["promptLength"], 7);
}

#[tokio::test]
async fn remote_moderation_outage_faults() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-6", json!({ "prompt": "an ordinary prompt" }));
    Mock::queue(&mock.moderation_replies, 500, json!({ "error": "down" }));

    let extra = format!(
        "enableCsamFilter: openai\nopenaiApiKey: sk-test\nopenaiModerationUrl: {base}/v1/moderations"
    );
    let (outcome, cycle) = run_once(&base, &extra).await;
    assert_eq!(outcome, CycleOutcome::Handled);
    assert_eq!(mock.generate_calls(), 0);

    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0]["state"], "faulted");

    let recent = cycle.deps().status.recent_jobs().await;
    assert_eq!(recent[0].status, "csam_openai_unavailable");
    assert_eq!(recent[0].openai_flagged, None);
}

#[tokio::test]
async fn remote_moderation_clear_generates() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-7", json!({ "prompt": "an ordinary prompt" }));

    let extra = format!(
        "enableCsamFilter: openai\nopenaiApiKey: sk-test\nopenaiModerationUrl: {base}/v1/moderations"
    );
    let (outcome, _) = run_once(&base, &extra).await;
    assert_eq!(outcome, CycleOutcome::Success);

    let moderation = mock.moderation_bodies.lock().unwrap()[0].clone();
    assert_eq!(moderation["model"], "omni-moderation-latest");
    assert_eq!(moderation["input"], "an ordinary prompt");
}

#[tokio::test]
async fn remote_flag_gets_safe_response() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-8", json!({ "prompt": "an ordinary prompt" }));
    Mock::queue(
        &mock.moderation_replies,
        200,
        json!({ "results": [{
            "categories": { "sexual/minors": true },
            "category_scores": { "sexual/minors": 0.98 }
        }] }),
    );

    let extra = format!(
        "enableCsamFilter: openai\nopenaiApiKey: sk-test\nopenaiModerationUrl: {base}/v1/moderations"
    );
    let (outcome, cycle) = run_once(&base, &extra).await;
    assert_eq!(outcome, CycleOutcome::Handled);
    assert_eq!(mock.submits()[0]["state"], "csam");

    let recent = cycle.deps().status.recent_jobs().await;
    assert_eq!(recent[0].status, "csam_responded");
    assert_eq!(recent[0].csam_score, Some(0.98));
    assert_eq!(recent[0].openai_flagged, Some(true));
}

#[tokio::test]
async fn context_overflow_faults_without_generating() {
    let (base, mock) = start_server().await;
    // 90 chars in one word estimates to 30 tokens; 100 - 80 leaves 20.
    mock.pop_job("job-9", json!({ "prompt": "x".repeat(90), "max_length": 80 }));

    let (outcome, cycle) = run_once(&base, "ctx: 100\nenforceCtxLimit: enabled").await;
    assert_eq!(outcome, CycleOutcome::Handled);
    assert_eq!(mock.generate_calls(), 0);

    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0]["state"], "faulted");
    assert_eq!(submits[0]["seed"], -1);

    let err = cycle.deps().status.last_error().await.unwrap();
    assert_eq!(err.message, "ctx limit: prompt 30 > allowed 20");
    assert_eq!(cycle.deps().status.recent_jobs().await[0].status, "ctx_limit");
}

#[tokio::test]
async fn rejected_context_fault_is_failure() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-9b", json!({ "prompt": "x".repeat(90), "max_length": 80 }));
    for _ in 0..10 {
        Mock::queue(&mock.submit_replies, 500, json!({}));
    }

    let (outcome, cycle) = run_once(&base, "ctx: 100\nenforceCtxLimit: enabled").await;
    assert_eq!(outcome, CycleOutcome::Failure);
    assert_eq!(mock.generate_calls(), 0);
    assert_eq!(mock.submits().len(), 5);

    let status = &cycle.deps().status;
    assert_eq!(status.recent_jobs().await[0].status, "ctx_limit_submit_failed");
    assert_eq!(status.worker(0).await.unwrap().status, WorkerStatus::CtxLimit);
    assert!(status.last_error().await.unwrap().message.contains("failed faulted submit for job-9b"));
}

#[tokio::test]
async fn context_check_disabled_by_default() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-10", json!({ "prompt": "x".repeat(90), "max_length": 80 }));

    let (outcome, _) = run_once(&base, "ctx: 100").await;
    assert_eq!(outcome, CycleOutcome::Success);
    assert_eq!(mock.generate_calls(), 1);
}

#[tokio::test]
async fn generation_failures_escalate_to_fault() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-11", json!({ "prompt": "hello" }));
    for _ in 0..3 {
        Mock::queue(&mock.generate_replies, 500, json!({ "error": "oom" }));
    }

    let (outcome, cycle) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Failure);
    assert_eq!(mock.generate_calls(), 3);

    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0]["state"], "faulted");
    assert_eq!(
        cycle.deps().status.worker(0).await.unwrap().status,
        WorkerStatus::GenerationFailed
    );
    assert_eq!(cycle.deps().status.recent_jobs().await[0].status, "generation_failure");
}

#[tokio::test]
async fn unparseable_generation_is_retried() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-12", json!({ "prompt": "hello" }));
    Mock::queue(&mock.generate_replies, 200, json!({ "unexpected": true }));

    let (outcome, _) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Success);
    assert_eq!(mock.generate_calls(), 2);
}

#[tokio::test]
async fn submit_failures_escalate_to_fault() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-13", json!({ "prompt": "hello" }));
    for _ in 0..5 {
        Mock::queue(&mock.submit_replies, 502, json!({}));
    }

    let (outcome, cycle) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Failure);

    let submits = mock.submits();
    assert_eq!(submits.len(), 6);
    assert_eq!(submits[5]["state"], "faulted");
    assert_eq!(
        cycle.deps().status.worker(0).await.unwrap().status,
        WorkerStatus::SubmitFailed
    );
}

#[tokio::test]
async fn missing_reward_is_retried() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-14", json!({ "prompt": "hello" }));
    Mock::queue(&mock.submit_replies, 200, json!({ "message": "ok?" }));

    let (outcome, cycle) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Success);
    assert_eq!(mock.submits().len(), 2);
    assert_eq!(cycle.deps().status.stats().await.kudos, 1.5);
}

#[tokio::test]
async fn unhealthy_backend_skips_polling() {
    let (base, mock) = start_server().await;
    mock.health_status.store(503, Ordering::SeqCst);

    let (outcome, _) = run_once(&base, "").await;
    assert_eq!(outcome, CycleOutcome::Failure);
    assert_eq!(mock.pop_calls(), 0);
}

#[tokio::test]
async fn health_result_is_cached() {
    let (base, mock) = start_server().await;
    let (deps, _) = build_deps(config(&base, ""));
    let mut cycle = JobCycle::new(0, deps);

    for _ in 0..3 {
        let outcome = timeout(TEST_TIMEOUT, cycle.run()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoWork);
    }
    assert_eq!(mock.health_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.pop_calls(), 3);
}

#[tokio::test]
async fn prompt_audit_file_records_claims() {
    let (base, mock) = start_server().await;
    mock.pop_job("job-15", json!({ "prompt": "hello" }));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prompts.log");

    let (outcome, _) = run_once(&base, &format!("outputPrompt: {}", path.display())).await;
    assert_eq!(outcome, CycleOutcome::Success);

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("] job=job-15\nhello\n\n"));
}

#[tokio::test]
async fn tokenizing_backend_trims_with_job_budget() {
    let (base, mock) = start_server().await;
    // The job's own window (20 - 10) governs trimming, not the configured ctx.
    let prompt = vec!["word"; 30].join(" ");
    mock.pop_job(
        "job-16",
        json!({ "prompt": prompt, "max_context_length": 20, "max_length": 10 }),
    );

    let (outcome, _) = run_once(&base, "serverEngine: tabbyapi").await;
    assert_eq!(outcome, CycleOutcome::Success);

    let generate = mock.generate_bodies.lock().unwrap()[0].clone();
    assert_eq!(generate["prompt"], "trimmed:10");
}

#[tokio::test]
async fn consecutive_failures_stop_the_pool() {
    let (base, mock) = start_server().await;
    mock.health_status.store(500, Ordering::SeqCst);

    let (deps, runtime) = build_deps(config(&base, "threads: 2\nmaxFailedRequests: 3"));
    let pool = WorkerPool::new(deps, runtime.clone());

    timeout(TEST_TIMEOUT, pool.run()).await.expect("pool did not stop");
    assert!(!runtime.is_running());
    assert!(runtime.consecutive_failures() >= 3);
    assert_eq!(mock.pop_calls(), 0);
}

#[tokio::test]
async fn graceful_shutdown_starts_no_cycles() {
    let (base, mock) = start_server().await;
    let (deps, runtime) = build_deps(config(&base, "threads: 3"));
    let pool = WorkerPool::new(deps, runtime.clone());

    runtime.request_shutdown();
    timeout(TEST_TIMEOUT, pool.run()).await.expect("pool did not stop");
    assert_eq!(mock.pop_calls(), 0);
    assert!(runtime.is_running());
}

#[tokio::test]
async fn preflight_reports_backend_health() {
    let (base, mock) = start_server().await;
    let (deps, runtime) = build_deps(config(&base, ""));
    let pool = WorkerPool::new(deps, runtime);
    assert!(pool.preflight().await);

    mock.health_status.store(404, Ordering::SeqCst);
    let (deps, runtime) = build_deps(config(&base, ""));
    let pool = WorkerPool::new(deps, runtime);
    assert!(!pool.preflight().await);
}
