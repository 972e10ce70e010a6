//! Configuration loading and validation.
//!
//! The bridge reads a flat YAML mapping (camelCase keys) and normalizes it
//! into a [`BridgeConfig`]. Values are accepted leniently (booleans may be
//! written as `enabled`/`disabled`, numbers as strings) but anything that
//! cannot be coerced is rejected with a [`ConfigError`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::backend::Backend;
use crate::error::ConfigError;
use crate::moderation::{ModerationMode, PositiveAction};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "HORDE_BRIDGE_CONFIG";

pub const DEFAULT_CLUSTER_URL: &str = "https://stablehorde.net";
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
pub const DEFAULT_BLOCKED_RESPONSE: &str =
    "Your request has been filtered by this worker safety policy.";
pub const DEFAULT_METADATA_REF: &str = "omni-moderation-latest sexual/minors";
pub const DEFAULT_MODERATION_URL: &str = "https://api.openai.com/v1/moderations";

const PLACEHOLDER_API_KEY: &str = "0000000000";
const MODERATION_HARD_MAX_INPUT_TOKENS: u32 = 30_000;

/// Moderation settings.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub mode: ModerationMode,
    pub positive_action: PositiveAction,
    /// Text submitted in place of a generation when a prompt is blocked.
    pub blocked_response: String,
    /// Reference attached to the censorship metadata entry.
    pub metadata_ref: String,
    /// Token budget for prompts sent to the remote classifier.
    pub max_input_tokens: u32,
    pub api_key: Option<SecretString>,
    pub url: String,
}

/// Fully validated bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub cluster_url: String,
    pub worker_name: String,
    pub horde_api_key: SecretString,
    pub priority_usernames: Vec<String>,
    pub worker_id: Option<String>,
    pub worker_info: Option<String>,
    pub server_url: String,
    pub server_engine: Backend,
    /// Overrides the `model` field of every backend request when set.
    pub server_model: Option<String>,
    pub server_api_key: Option<SecretString>,
    /// Model name advertised to the cluster.
    pub model: String,
    /// Context window advertised to the cluster.
    pub ctx: u32,
    /// Maximum output length advertised to the cluster.
    pub max_length: u32,
    pub enforce_ctx_limit: bool,
    /// Tokens-per-second ceiling across all workers (`None` = unlimited).
    pub max_tps: Option<f64>,
    pub refresh_time: Duration,
    pub nsfw: bool,
    pub moderation: ModerationConfig,
    pub output_prompt: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub threads: u32,
    pub timeout: Duration,
    pub thread_poll_stagger: bool,
    pub max_failed_requests: u32,
    pub submit_retry_delay: Duration,
}

impl BridgeConfig {
    /// Resolve the config path from `HORDE_BRIDGE_CONFIG`, falling back to `config.yaml`.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate YAML content.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = if content.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        };
        raw.validate()
    }
}

/// A scalar YAML value before coercion.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }

    fn toggle(&self, key: &str) -> Result<bool, ConfigError> {
        if let Self::Bool(b) = self {
            return Ok(*b);
        }
        match self.text().to_lowercase().as_str() {
            "enabled" | "true" | "1" => Ok(true),
            "disabled" | "false" | "0" => Ok(false),
            other => Err(ConfigError::invalid(
                key,
                format!("\"{other}\" is not a toggle. Use enabled/disabled."),
            )),
        }
    }

    fn int(&self, key: &str) -> Result<i64, ConfigError> {
        match self {
            Self::Int(i) => Ok(*i),
            _ => self
                .text()
                .parse::<i64>()
                .map_err(|_| ConfigError::invalid(key, format!("\"{}\" is not an integer", self.text()))),
        }
    }

    fn number(&self, key: &str) -> Result<f64, ConfigError> {
        match self {
            Self::Int(i) => Ok(*i as f64),
            Self::Float(f) => Ok(*f),
            _ => self
                .text()
                .parse::<f64>()
                .map_err(|_| ConfigError::invalid(key, format!("\"{}\" is not a number", self.text()))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Option<Scalar>>),
    One(Scalar),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    cluster_url: Option<Scalar>,
    worker_name: Option<Scalar>,
    #[serde(rename = "AiHordeApiKey")]
    ai_horde_api_key: Option<Scalar>,
    priority_usernames: Option<OneOrMany>,
    worker_id: Option<Scalar>,
    worker_info: Option<Scalar>,
    server_url: Option<Scalar>,
    server_engine: Option<Scalar>,
    server_model: Option<Scalar>,
    server_api_key: Option<Scalar>,
    model: Option<Scalar>,
    ctx: Option<Scalar>,
    max_length: Option<Scalar>,
    enforce_ctx_limit: Option<Scalar>,
    max_tps: Option<Scalar>,
    refresh_time: Option<Scalar>,
    nsfw: Option<Scalar>,
    enable_csam_filter: Option<Scalar>,
    csam_positive_action: Option<Scalar>,
    csam_blocked_response: Option<Scalar>,
    csam_metadata_ref: Option<Scalar>,
    openai_moderation_max_tokens: Option<Scalar>,
    openai_api_key: Option<Scalar>,
    openai_moderation_url: Option<Scalar>,
    output_prompt: Option<Scalar>,
    log_file: Option<Scalar>,
    threads: Option<Scalar>,
    timeout: Option<Scalar>,
    thread_poll_stagger: Option<Scalar>,
    max_failed_requests: Option<Scalar>,
    submit_retry_delay_ms: Option<Scalar>,
}

/// Non-empty trimmed text, or `None`.
fn optional_text(value: &Option<Scalar>) -> Option<String> {
    value.as_ref().map(Scalar::text).filter(|s| !s.is_empty())
}

fn text_or(value: &Option<Scalar>, default: &str) -> String {
    optional_text(value).unwrap_or_else(|| default.to_string())
}

fn toggle_or(value: &Option<Scalar>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match value {
        Some(v) if !v.text().is_empty() => v.toggle(key),
        _ => Ok(default),
    }
}

fn int_in_range(
    value: &Option<Scalar>,
    key: &str,
    min: i64,
    max: i64,
    default: i64,
) -> Result<i64, ConfigError> {
    let Some(v) = value.as_ref().filter(|v| !v.text().is_empty()) else {
        return Ok(default);
    };
    let n = v.int(key)?;
    if n < min || n > max {
        return Err(ConfigError::invalid(
            key,
            format!("{n} is out of range. Use an integer between {min} and {max}."),
        ));
    }
    Ok(n)
}

fn required_positive(value: &Option<Scalar>, key: &str) -> Result<u32, ConfigError> {
    if optional_text(value).is_none() {
        return Err(ConfigError::missing(key, "Set a positive integer in config.yaml"));
    }
    Ok(int_in_range(value, key, 1, u32::MAX as i64, 1)? as u32)
}

fn parse_moderation_mode(value: &Option<Scalar>) -> Result<ModerationMode, ConfigError> {
    let Some(v) = value else {
        return Ok(ModerationMode::Local);
    };
    if let Scalar::Bool(b) = v {
        return Ok(if *b {
            ModerationMode::Local
        } else {
            ModerationMode::Disabled
        });
    }
    match v.text().to_lowercase().as_str() {
        "" | "enabled" | "true" | "1" | "regex" | "local" => Ok(ModerationMode::Local),
        "disabled" | "false" | "0" => Ok(ModerationMode::Disabled),
        "openai" | "remote" => Ok(ModerationMode::Remote),
        other => Err(ConfigError::invalid(
            "enableCsamFilter",
            format!("\"{other}\" is not supported. Use disabled/regex/openai."),
        )),
    }
}

fn parse_positive_action(value: &Option<Scalar>) -> Result<PositiveAction, ConfigError> {
    match optional_text(value).map(|s| s.to_lowercase()).as_deref() {
        None | Some("respond") => Ok(PositiveAction::Respond),
        Some("fault") => Ok(PositiveAction::Fault),
        Some(other) => Err(ConfigError::invalid(
            "csamPositiveAction",
            format!("\"{other}\" is not supported. Use respond/fault."),
        )),
    }
}

fn parse_usernames(value: &Option<OneOrMany>) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => {
            let name = s.text();
            if name.is_empty() { Vec::new() } else { vec![name] }
        }
        Some(OneOrMany::Many(items)) => items
            .iter()
            .flatten()
            .map(Scalar::text)
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

impl RawConfig {
    fn validate(self) -> Result<BridgeConfig, ConfigError> {
        let model = optional_text(&self.model)
            .ok_or_else(|| ConfigError::missing("model", "Set the model name advertised to the cluster"))?;
        let ctx = required_positive(&self.ctx, "ctx")?;

        let engine_name = optional_text(&self.server_engine).ok_or_else(|| {
            ConfigError::missing("serverEngine", "Set one of ollama, vllm, tabbyapi, sglang, koboldcpp, llamacpp")
        })?;
        let server_engine = Backend::from_name(&engine_name)
            .map_err(|e| ConfigError::invalid("serverEngine", e.to_string()))?;

        let server_model = optional_text(&self.server_model);
        if server_engine == Backend::Ollama && server_model.is_none() {
            return Err(ConfigError::missing(
                "serverModel",
                "Required when serverEngine is set to \"ollama\"",
            ));
        }

        let horde_api_key = optional_text(&self.ai_horde_api_key)
            .filter(|k| k != PLACEHOLDER_API_KEY)
            .ok_or_else(|| {
                ConfigError::missing("AiHordeApiKey", "The default placeholder value is not accepted")
            })?;

        let mode = parse_moderation_mode(&self.enable_csam_filter)?;
        let openai_api_key = optional_text(&self.openai_api_key);
        if mode == ModerationMode::Remote && openai_api_key.is_none() {
            return Err(ConfigError::missing(
                "openaiApiKey",
                "Required when enableCsamFilter is set to \"openai\"",
            ));
        }

        let max_tps = match self.max_tps.as_ref().filter(|v| !v.text().is_empty()) {
            None => None,
            Some(v) => {
                let tps = v.number("maxTps")?;
                if !tps.is_finite() || tps <= 0.0 {
                    return Err(ConfigError::invalid("maxTps", "must be a positive number"));
                }
                Some(tps)
            }
        };

        let moderation = ModerationConfig {
            mode,
            positive_action: parse_positive_action(&self.csam_positive_action)?,
            blocked_response: text_or(&self.csam_blocked_response, DEFAULT_BLOCKED_RESPONSE),
            metadata_ref: text_or(&self.csam_metadata_ref, DEFAULT_METADATA_REF),
            max_input_tokens: int_in_range(
                &self.openai_moderation_max_tokens,
                "openaiModerationMaxTokens",
                1,
                MODERATION_HARD_MAX_INPUT_TOKENS as i64,
                10_000,
            )? as u32,
            api_key: openai_api_key.map(SecretString::from),
            url: text_or(&self.openai_moderation_url, DEFAULT_MODERATION_URL),
        };

        Ok(BridgeConfig {
            cluster_url: text_or(&self.cluster_url, DEFAULT_CLUSTER_URL)
                .trim_end_matches('/')
                .to_string(),
            worker_name: text_or(&self.worker_name, "Worker"),
            horde_api_key: SecretString::from(horde_api_key),
            priority_usernames: parse_usernames(&self.priority_usernames),
            worker_id: optional_text(&self.worker_id),
            worker_info: optional_text(&self.worker_info),
            server_url: text_or(&self.server_url, DEFAULT_SERVER_URL)
                .trim_end_matches('/')
                .to_string(),
            server_engine,
            server_model,
            server_api_key: optional_text(&self.server_api_key).map(SecretString::from),
            model,
            ctx,
            max_length: int_in_range(&self.max_length, "maxLength", 1, u32::MAX as i64, 512)? as u32,
            enforce_ctx_limit: toggle_or(&self.enforce_ctx_limit, "enforceCtxLimit", false)?,
            max_tps,
            refresh_time: Duration::from_millis(
                int_in_range(&self.refresh_time, "refreshTime", 1, i64::MAX, 5000)? as u64,
            ),
            nsfw: toggle_or(&self.nsfw, "nsfw", false)?,
            moderation,
            output_prompt: optional_text(&self.output_prompt).map(PathBuf::from),
            log_file: optional_text(&self.log_file).map(PathBuf::from),
            threads: int_in_range(&self.threads, "threads", 1, 1024, 1)? as u32,
            timeout: Duration::from_secs(int_in_range(&self.timeout, "timeout", 1, 86_400, 120)? as u64),
            thread_poll_stagger: toggle_or(&self.thread_poll_stagger, "threadPollStagger", false)?,
            max_failed_requests: int_in_range(
                &self.max_failed_requests,
                "maxFailedRequests",
                1,
                u32::MAX as i64,
                crate::worker::MAX_FAILED_REQUESTS as i64,
            )? as u32,
            submit_retry_delay: Duration::from_millis(int_in_range(
                &self.submit_retry_delay_ms,
                "submitRetryDelayMs",
                0,
                i64::MAX,
                10_000,
            )? as u64),
        })
    }
}
