//! TabbyAPI `/v1/completions` (OpenAI-compatible completions).

use serde_json::{Value, json};

use crate::error::BackendError;
use crate::horde::JobPayload;

pub(super) const ENCODE_PATH: &str = "/v1/token/encode";
pub(super) const DECODE_PATH: &str = "/v1/token/decode";

/// TabbyAPI accepts the cluster payload as-is; tail-free sampling is pinned off.
pub(super) fn build_request(payload: &JobPayload) -> Value {
    let mut request = payload.to_value();
    request["tfs"] = json!(1.0);
    request
}

pub(super) fn extract_generation(data: &Value) -> Result<String, BackendError> {
    data.pointer("/choices/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::malformed("tabbyapi", "missing choices[0].text"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_payload_through_with_tfs() {
        let payload = JobPayload::from_value(&json!({"prompt": "p", "max_length": 50, "top_a": 0.2}));
        let req = build_request(&payload);
        assert_eq!(req["prompt"], "p");
        assert_eq!(req["max_length"], 50);
        assert_eq!(req["top_a"], 0.2);
        assert_eq!(req["tfs"], 1.0);
    }

    #[test]
    fn extracts_first_choice() {
        let data = json!({"choices": [{"text": "done"}]});
        assert_eq!(extract_generation(&data).unwrap(), "done");
        assert!(extract_generation(&json!({"choices": []})).is_err());
    }
}
