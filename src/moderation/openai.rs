//! Remote classification through the OpenAI moderation endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::InvalidHeaderValue;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::{Classification, ModerationClassifier};
use crate::error::ModerationError;
use crate::http::{HttpClient, header_map};

pub const MODERATION_MODEL: &str = "omni-moderation-latest";

/// Per-request timeout for the classifier, independent of the bridge timeout.
pub const MODERATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Category keys used for the minors category across API revisions.
const MINORS_KEYS: [&str; 3] = ["sexual/minors", "sexual_minors", "sexual-minors"];

/// Client for `POST /v1/moderations`.
pub struct OpenAiModeration {
    http: HttpClient,
    url: String,
    headers: reqwest::header::HeaderMap,
}

impl OpenAiModeration {
    pub fn new(http: HttpClient, url: &str, api_key: &SecretString) -> Result<Self, InvalidHeaderValue> {
        let bearer = format!("Bearer {}", api_key.expose_secret());
        Ok(Self {
            http,
            url: url.to_string(),
            headers: header_map(&[("authorization", bearer.as_str())])?,
        })
    }
}

#[async_trait]
impl ModerationClassifier for OpenAiModeration {
    async fn classify(&self, input: &str) -> Result<Classification, ModerationError> {
        let body = json!({ "model": MODERATION_MODEL, "input": input });
        let response = self.http.post(&self.url, &body, &self.headers).await;

        if !response.ok {
            return Err(match response.status {
                Some(status) => ModerationError::Status(status),
                None => ModerationError::Transport(response.error.unwrap_or_default()),
            });
        }

        parse_result(&response.data)
    }
}

/// Read the minors category from `results[0]`.
pub(crate) fn parse_result(data: &Value) -> Result<Classification, ModerationError> {
    let result = data
        .pointer("/results/0")
        .filter(|r| r.is_object())
        .ok_or_else(|| ModerationError::Malformed("missing results[0]".to_string()))?;

    let flagged = result
        .get("categories")
        .map(|categories| {
            MINORS_KEYS
                .iter()
                .any(|key| categories.get(*key).and_then(Value::as_bool) == Some(true))
        })
        .unwrap_or(false);

    let score = result.get("category_scores").and_then(|scores| {
        MINORS_KEYS
            .iter()
            .find_map(|key| scores.get(*key).and_then(Value::as_f64))
    });

    Ok(Classification { flagged, score })
}
