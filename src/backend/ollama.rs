//! Ollama `/api/generate`.

use serde_json::{Value, json};

use crate::error::BackendError;
use crate::horde::JobPayload;

pub(super) fn build_request(payload: &JobPayload) -> Value {
    let mut options = json!({
        "num_predict": payload.max_length,
        "num_ctx": payload.max_context_length,
        "temperature": payload.number_or("temperature", 1.0),
        "top_p": payload.number_or("top_p", 1.0),
        "repeat_penalty": payload.number_or("rep_pen", 1.0),
        "repeat_last_n": payload.integer("rep_pen_range").unwrap_or(64),
        "stop": payload.stop_sequences(),
    });

    // Ollama has no disabled sentinel for top_k; leave it unset instead.
    if let Some(top_k) = payload.integer("top_k").filter(|k| *k > 0) {
        options["top_k"] = json!(top_k);
    }

    json!({
        "prompt": payload.prompt,
        "stream": false,
        "options": options,
    })
}

pub(super) fn extract_generation(data: &Value) -> Result<String, BackendError> {
    data.get("response")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::malformed("ollama", "missing response field"))
}
