//! Inference backend adapters.
//!
//! Each supported server speaks its own HTTP+JSON dialect. [`Backend`] is a
//! closed set of variants; the variant is chosen once at startup and the job
//! cycle only ever talks to it through the methods below:
//! - `health_path` / `generate_path`: endpoints relative to the server URL
//! - `build_request`: job payload → backend-native request
//! - `extract_generation`: backend-native response → generated text
//! - `supports_tokenize`: whether [`InferenceServer::tokenize`] can be exact

mod koboldcpp;
mod llamacpp;
mod ollama;
mod server;
mod sglang;
mod tabbyapi;
mod vllm;

pub use server::InferenceServer;

use serde_json::Value;

use crate::error::BackendError;
use crate::horde::JobPayload;

/// Supported inference servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Ollama,
    Vllm,
    TabbyApi,
    Sglang,
    KoboldCpp,
    LlamaCpp,
}

impl Backend {
    pub const ALL: [Backend; 6] = [
        Backend::Ollama,
        Backend::Vllm,
        Backend::TabbyApi,
        Backend::Sglang,
        Backend::KoboldCpp,
        Backend::LlamaCpp,
    ];

    /// Parse a configured engine name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, BackendError> {
        let normalized = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|b| b.name() == normalized)
            .ok_or_else(|| BackendError::Unsupported(name.trim().to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
            Self::TabbyApi => "tabbyapi",
            Self::Sglang => "sglang",
            Self::KoboldCpp => "koboldcpp",
            Self::LlamaCpp => "llamacpp",
        }
    }

    pub fn health_path(&self) -> &'static str {
        match self {
            Self::Ollama => "/api/tags",
            Self::Vllm | Self::TabbyApi | Self::Sglang => "/health",
            Self::KoboldCpp => "/api/extra/version",
            Self::LlamaCpp => "/props",
        }
    }

    pub fn generate_path(&self) -> &'static str {
        match self {
            Self::Ollama => "/api/generate",
            Self::Vllm | Self::Sglang => "/generate",
            Self::TabbyApi => "/v1/completions",
            Self::KoboldCpp => "/api/v1/generate",
            Self::LlamaCpp => "/completion",
        }
    }

    /// Whether the server exposes token encode/decode endpoints.
    pub fn supports_tokenize(&self) -> bool {
        matches!(self, Self::TabbyApi)
    }

    /// Map a job payload to the backend-native request body.
    pub fn build_request(&self, payload: &JobPayload) -> Value {
        match self {
            Self::Ollama => ollama::build_request(payload),
            Self::Vllm => vllm::build_request(payload),
            Self::TabbyApi => tabbyapi::build_request(payload),
            Self::Sglang => sglang::build_request(payload),
            Self::KoboldCpp => koboldcpp::build_request(payload),
            Self::LlamaCpp => llamacpp::build_request(payload),
        }
    }

    /// Pull the generated text out of a backend response.
    pub fn extract_generation(&self, data: &Value, prompt: &str) -> Result<String, BackendError> {
        match self {
            Self::Ollama => ollama::extract_generation(data),
            Self::Vllm => vllm::extract_generation(data, prompt),
            Self::TabbyApi => tabbyapi::extract_generation(data),
            Self::Sglang => sglang::extract_generation(data),
            Self::KoboldCpp => koboldcpp::extract_generation(data),
            Self::LlamaCpp => llamacpp::extract_generation(data),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `top_k` with the "disabled" sentinel 0 translated to `-1`.
fn top_k_or_disabled(payload: &JobPayload) -> i64 {
    match payload.integer("top_k") {
        None | Some(0) => -1,
        Some(k) => k,
    }
}

/// A string, or the first element of an array of strings.
fn first_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Array(items) => items.first().and_then(Value::as_str),
        _ => None,
    }
}
