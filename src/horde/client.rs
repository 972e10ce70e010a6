//! Cluster API client.

use reqwest::Url;
use reqwest::header::{HeaderMap, InvalidHeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::horde::types::{PopRequest, SubmitRequest};
use crate::http::{HttpClient, HttpResponse, header_map};

/// Maximum length of the public worker description.
pub const WORKER_INFO_MAX_CHARS: usize = 500;

/// Client for the cluster's generate/submit/worker endpoints.
#[derive(Debug, Clone)]
pub struct HordeClient {
    http: HttpClient,
    base_url: String,
    /// `apikey` header, used by the generate endpoints.
    headers: HeaderMap,
    /// `X-Api-Key` + `apikey`, used by the worker endpoints.
    info_headers: HeaderMap,
}

impl HordeClient {
    pub fn new(
        http: HttpClient,
        base_url: &str,
        api_key: &SecretString,
    ) -> Result<Self, InvalidHeaderValue> {
        let key = api_key.expose_secret();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: header_map(&[("apikey", key)])?,
            info_headers: header_map(&[("x-api-key", key), ("apikey", key)])?,
        })
    }

    /// `{base}/api/v2/workers/{id}` with the id escaped as one path segment.
    fn worker_url(&self, worker_id: &str) -> Option<Url> {
        let mut url = Url::parse(&self.base_url).ok()?;
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["api", "v2", "workers", worker_id]);
        Some(url)
    }

    /// Ask the cluster for the next job.
    pub async fn pop(&self, request: &PopRequest) -> HttpResponse {
        let body = json!(request);
        self.http
            .post(&format!("{}/api/v2/generate/text/pop", self.base_url), &body, &self.headers)
            .await
    }

    /// Submit a generation, fault or moderation response.
    pub async fn submit(&self, request: &SubmitRequest) -> HttpResponse {
        let body = json!(request);
        self.http
            .post(&format!("{}/api/v2/generate/text/submit", self.base_url), &body, &self.headers)
            .await
    }

    /// Publish the worker description and confirm it is visible.
    ///
    /// Best effort: every outcome is logged, nothing is returned.
    pub async fn update_worker_info(&self, worker_id: &str, info: &str) {
        let Some(url) = self.worker_url(worker_id) else {
            warn!(cluster = %self.base_url, "Cluster URL cannot carry a worker path, skipping worker description");
            return;
        };
        let url = url.as_str();
        let info: String = info.chars().take(WORKER_INFO_MAX_CHARS).collect();

        let put = self.http.put(url, &json!({ "info": info }), &self.info_headers).await;
        if !put.ok {
            warn!(worker_id = %worker_id, error = %put.describe(), "Failed to update worker description");
            return;
        }
        info!(worker_id = %worker_id, "Worker description updated");

        let verify = self.http.get(url, &self.info_headers).await;
        if !verify.ok {
            warn!("Worker info PUT accepted, but verification GET failed");
            return;
        }
        match verify.data.get("info").and_then(Value::as_str).map(str::trim) {
            Some(applied) if !applied.is_empty() => {
                info!(info = %applied, "Worker info is visible via API");
            }
            _ => warn!("Worker info PUT accepted, but \"info\" is not visible in worker GET response"),
        }
    }
}
