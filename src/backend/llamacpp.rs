//! llama.cpp server `/completion`.

use serde_json::{Value, json};

use crate::error::BackendError;
use crate::horde::JobPayload;

pub(super) fn build_request(payload: &JobPayload) -> Value {
    let n_keep = i64::from(payload.max_context_length) - i64::from(payload.max_length);

    json!({
        "prompt": payload.prompt,
        "stop": payload.stop_sequences(),
        "n_predict": payload.max_length,
        "n_keep": n_keep,
        "temperature": payload.number_or("temperature", 1.0),
        "tfs_z": payload.number_or("tfs", 1.0),
        "top_k": payload.integer("top_k").unwrap_or(-1),
        "top_p": payload.number_or("top_p", 1.0),
        "repeat_penalty": payload.number_or("rep_pen", 1.0),
        "repeat_last_n": payload.integer("rep_pen_range").unwrap_or(64),
        "typical_p": payload.number_or("typical", 0.0),
    })
}

pub(super) fn extract_generation(data: &Value) -> Result<String, BackendError> {
    data.get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::malformed("llamacpp", "missing content field"))
}
