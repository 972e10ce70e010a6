//! vLLM `/generate`.

use serde_json::{Value, json};

use super::{first_text, top_k_or_disabled};
use crate::error::BackendError;
use crate::horde::JobPayload;

const MIN_REPETITION_PENALTY: f64 = 0.01;
const MAX_REPETITION_PENALTY: f64 = 2.0;

pub(super) fn build_request(payload: &JobPayload) -> Value {
    let repetition_penalty = payload
        .number_or("rep_pen", 1.0)
        .clamp(MIN_REPETITION_PENALTY, MAX_REPETITION_PENALTY);

    json!({
        "prompt": payload.prompt,
        "stop": payload.stop_sequences(),
        "max_tokens": payload.max_length,
        "temperature": payload.number_or("temperature", 1.0),
        "top_k": top_k_or_disabled(payload),
        "top_p": payload.number_or("top_p", 1.0),
        "repetition_penalty": repetition_penalty,
    })
}

/// vLLM echoes the prompt in front of the completion.
pub(super) fn extract_generation(data: &Value, prompt: &str) -> Result<String, BackendError> {
    let text = data
        .get("text")
        .and_then(first_text)
        .ok_or_else(|| BackendError::malformed("vllm", "missing text field"))?;

    if let Some(rest) = text.strip_prefix(prompt) {
        return Ok(rest.to_string());
    }
    text.get(prompt.len()..)
        .map(str::to_string)
        .ok_or_else(|| BackendError::malformed("vllm", "response shorter than the prompt"))
}
