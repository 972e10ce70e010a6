//! Wire types for the cluster's text-generation API.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Output length assumed when a job does not declare one.
pub const DEFAULT_JOB_MAX_LENGTH: u32 = 80;
/// Context length assumed when a job does not declare one.
pub const DEFAULT_JOB_MAX_CONTEXT_LENGTH: u32 = 1024;

/// Generation payload of a claimed job.
///
/// Only the fields the bridge reasons about are typed. Sampling parameters
/// vary by client and are kept as received, then read with explicit
/// presence checks by each backend mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPayload {
    pub prompt: String,
    pub max_length: u32,
    pub max_context_length: u32,
    /// Every other payload field, untouched.
    pub params: Map<String, Value>,
}

impl JobPayload {
    /// Build a payload from the loosely-typed `payload` object of a pop response.
    pub fn from_value(value: &Value) -> Self {
        let mut params = value.as_object().cloned().unwrap_or_default();
        let prompt = match params.remove("prompt") {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let max_length = take_positive(&mut params, "max_length").unwrap_or(DEFAULT_JOB_MAX_LENGTH);
        let max_context_length = take_positive(&mut params, "max_context_length")
            .unwrap_or(DEFAULT_JOB_MAX_CONTEXT_LENGTH);

        Self {
            prompt,
            max_length,
            max_context_length,
            params,
        }
    }

    /// A numeric sampling parameter, if present and finite.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.params
            .get(key)
            .and_then(Value::as_f64)
            .filter(|n| n.is_finite())
    }

    /// Numeric parameter or a fallback.
    pub fn number_or(&self, key: &str, default: f64) -> f64 {
        self.number(key).unwrap_or(default)
    }

    /// Integer parameter (floats are truncated).
    pub fn integer(&self, key: &str) -> Option<i64> {
        let value = self.params.get(key)?;
        value.as_i64().or_else(|| value.as_f64().filter(|n| n.is_finite()).map(|n| n as i64))
    }

    /// `stop_sequence` as sent by the client, or an empty list.
    pub fn stop_sequences(&self) -> Value {
        match self.params.get("stop_sequence") {
            Some(v @ Value::Array(_)) => v.clone(),
            _ => Value::Array(Vec::new()),
        }
    }

    /// The full payload as a JSON object, typed fields included.
    pub fn to_value(&self) -> Value {
        let mut map = self.params.clone();
        map.insert("prompt".into(), Value::String(self.prompt.clone()));
        map.insert("max_length".into(), Value::from(self.max_length));
        map.insert("max_context_length".into(), Value::from(self.max_context_length));
        Value::Object(map)
    }
}

fn take_positive(params: &mut Map<String, Value>, key: &str) -> Option<u32> {
    params
        .remove(key)
        .and_then(|v| v.as_f64())
        .filter(|n| n.is_finite() && *n >= 1.0)
        .map(|n| n.min(u32::MAX as f64) as u32)
}

/// A job claimed from the cluster.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub received_at: DateTime<Utc>,
}

impl Job {
    /// Parse a pop response. `None` when the cluster had no work for us.
    pub fn from_pop_response(data: &Value) -> Option<Self> {
        let id = match data.get("id")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let payload = data
            .get("payload")
            .map(JobPayload::from_value)
            .unwrap_or_else(|| JobPayload::from_value(&Value::Null));

        Some(Self {
            id,
            payload,
            received_at: Utc::now(),
        })
    }
}

/// Body of `POST /api/v2/generate/text/pop`.
#[derive(Debug, Clone, Serialize)]
pub struct PopRequest {
    pub name: String,
    pub models: Vec<String>,
    pub nsfw: bool,
    pub max_length: u32,
    pub max_context_length: u32,
    pub priority_usernames: Vec<String>,
    pub threads: u32,
    pub softprompts: Vec<String>,
    pub bridge_agent: String,
}

/// Non-success submission states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitState {
    Faulted,
    Csam,
}

/// Entry of `gen_metadata` in a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// Body of `POST /api/v2/generate/text/submit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitRequest {
    pub id: String,
    pub generation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SubmitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gen_metadata: Option<Vec<GenMetadata>>,
}

impl SubmitRequest {
    /// A normal, reward-bearing generation.
    pub fn generation(id: &str, generation: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            generation: generation.into(),
            state: None,
            seed: None,
            gen_metadata: None,
        }
    }

    /// A fault report: the worker could not produce a usable generation.
    pub fn faulted(id: &str) -> Self {
        Self {
            id: id.to_string(),
            generation: "faulted".to_string(),
            state: Some(SubmitState::Faulted),
            seed: Some(-1),
            gen_metadata: None,
        }
    }

    /// A moderation auto-response tagged with censorship metadata.
    pub fn moderated(id: &str, response_text: &str, metadata_ref: &str) -> Self {
        Self {
            id: id.to_string(),
            generation: response_text.to_string(),
            state: Some(SubmitState::Csam),
            seed: None,
            gen_metadata: Some(vec![GenMetadata {
                kind: "censorship".to_string(),
                value: "csam".to_string(),
                reference: metadata_ref.to_string(),
            }]),
        }
    }
}
