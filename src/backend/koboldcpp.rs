//! KoboldCpp `/api/v1/generate` (native cluster payload format).

use serde_json::Value;

use crate::error::BackendError;
use crate::horde::JobPayload;

pub(super) fn build_request(payload: &JobPayload) -> Value {
    payload.to_value()
}

pub(super) fn extract_generation(data: &Value) -> Result<String, BackendError> {
    data.pointer("/results/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::malformed("koboldcpp", "missing results[0].text"))
}
