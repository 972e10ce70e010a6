//! A configured inference server: backend dialect + URL + credentials.

use reqwest::header::{HeaderMap, InvalidHeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use super::{Backend, tabbyapi};
use crate::error::BackendError;
use crate::horde::JobPayload;
use crate::http::{HttpClient, HttpResponse, header_map};

/// Inference server shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct InferenceServer {
    backend: Backend,
    base_url: String,
    headers: HeaderMap,
    model_override: Option<String>,
    http: HttpClient,
}

impl InferenceServer {
    pub fn new(
        backend: Backend,
        base_url: &str,
        api_key: Option<&SecretString>,
        model_override: Option<String>,
        http: HttpClient,
    ) -> Result<Self, InvalidHeaderValue> {
        let headers = match api_key {
            Some(key) => header_map(&[("authorization", key.expose_secret())])?,
            None => HeaderMap::new(),
        };
        Ok(Self {
            backend,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            model_override,
            http,
        })
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, self.backend.health_path())
    }

    pub fn generate_url(&self) -> String {
        format!("{}{}", self.base_url, self.backend.generate_path())
    }

    /// GET the health path; only HTTP 200 counts as healthy.
    pub async fn check_health(&self) -> Result<(), String> {
        let response = self.http.get(&self.health_url(), &self.headers).await;
        match response.status {
            Some(200) => Ok(()),
            Some(404) => Err("health endpoint not found".to_string()),
            Some(status) => Err(format!("health check status {status}")),
            None => Err(format!(
                "generation server unreachable: {}",
                response.error.unwrap_or_default()
            )),
        }
    }

    /// Backend-native request for a job, with the configured model override applied.
    pub fn build_request(&self, payload: &JobPayload) -> Value {
        let mut request = self.backend.build_request(payload);
        if let (Some(model), Some(object)) = (&self.model_override, request.as_object_mut()) {
            object.insert("model".into(), Value::String(model.clone()));
        }
        request
    }

    pub async fn generate(&self, request: &Value) -> HttpResponse {
        self.http.post(&self.generate_url(), request, &self.headers).await
    }

    pub fn extract_generation(&self, data: &Value, prompt: &str) -> Result<String, BackendError> {
        self.backend.extract_generation(data, prompt)
    }

    pub fn supports_tokenize(&self) -> bool {
        self.backend.supports_tokenize()
    }

    /// Exact tokenization, when the backend offers it and the call succeeds.
    pub async fn tokenize(&self, text: &str) -> Option<Vec<i64>> {
        if !self.supports_tokenize() {
            return None;
        }
        let url = format!("{}{}", self.base_url, tabbyapi::ENCODE_PATH);
        let response = self.http.post(&url, &json!({ "text": text }), &self.headers).await;
        if !response.ok {
            return None;
        }
        let tokens = response.data.get("tokens").cloned()?;
        serde_json::from_value(tokens)
            .inspect_err(|e| debug!(error = %e, "Unexpected token encode response"))
            .ok()
    }

    /// Inverse of [`tokenize`](Self::tokenize).
    pub async fn detokenize(&self, tokens: &[i64]) -> Option<String> {
        if !self.supports_tokenize() {
            return None;
        }
        let url = format!("{}{}", self.base_url, tabbyapi::DECODE_PATH);
        let response = self.http.post(&url, &json!({ "tokens": tokens }), &self.headers).await;
        if !response.ok {
            return None;
        }
        response.data.get("text").and_then(Value::as_str).map(str::to_string)
    }

    /// Prompt size in tokens: exact when possible, estimated otherwise.
    pub async fn count_prompt_tokens(&self, prompt: &str) -> usize {
        if prompt.is_empty() {
            return 0;
        }
        if let Some(tokens) = self.tokenize(prompt).await {
            return tokens.len();
        }
        estimate_tokens(prompt)
    }

    /// Generated size in tokens. Estimates are clamped to the requested output length.
    pub async fn count_generation_tokens(&self, generation: &str, max_length: u32) -> usize {
        if generation.is_empty() {
            return 0;
        }
        if let Some(tokens) = self.tokenize(generation).await {
            return tokens.len();
        }
        let estimate = estimate_tokens(generation);
        if max_length > 0 {
            estimate.min(max_length as usize)
        } else {
            estimate
        }
    }
}

/// Heuristic token count: the larger of the word count and chars / 3, at least 1.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count();
    let chars = text.chars().count().div_ceil(3);
    words.max(chars).max(1)
}
