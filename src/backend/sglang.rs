//! SGLang `/generate`.

use serde_json::{Value, json};

use super::{first_text, top_k_or_disabled};
use crate::error::BackendError;
use crate::horde::JobPayload;

pub(super) fn build_request(payload: &JobPayload) -> Value {
    json!({
        "text": payload.prompt,
        "sampling_params": {
            "stop": payload.stop_sequences(),
            "max_new_tokens": payload.max_length,
            "temperature": payload.number_or("temperature", 1.0),
            "top_k": top_k_or_disabled(payload),
            "top_p": payload.number_or("top_p", 1.0),
        },
    })
}

pub(super) fn extract_generation(data: &Value) -> Result<String, BackendError> {
    data.get("text")
        .and_then(first_text)
        .map(str::to_string)
        .ok_or_else(|| BackendError::malformed("sglang", "missing text field"))
}
