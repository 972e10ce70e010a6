//! Thin HTTP helpers with a uniform response shape.
//!
//! Every call resolves to an [`HttpResponse`]; transport failures and
//! non-2xx statuses are reported through `ok`/`status`/`error` instead of
//! being raised, so callers decide retry policy themselves.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use tracing::{error, info, warn};

/// Outcome of an HTTP call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// True for 2xx responses.
    pub ok: bool,
    /// HTTP status, absent on transport failure.
    pub status: Option<u16>,
    /// Parsed JSON body. Non-JSON bodies become a string, empty bodies `Null`.
    pub data: Value,
    /// Transport error message, if the request never got a response.
    pub error: Option<String>,
}

impl HttpResponse {
    fn transport_error(message: String) -> Self {
        Self {
            ok: false,
            status: None,
            data: Value::Null,
            error: Some(message),
        }
    }

    /// The cluster signals maintenance with `403 {"rc": "WorkerMaintenance"}`.
    pub fn is_worker_maintenance(&self) -> bool {
        self.status == Some(403) && self.data.get("rc").and_then(Value::as_str) == Some("WorkerMaintenance")
    }

    /// Short description for status/error reporting.
    pub fn describe(&self) -> String {
        match (self.status, &self.error) {
            (Some(status), _) => format!("HTTP {status}"),
            (None, Some(err)) => format!("connect error: {err}"),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// Build a header map, marking every value sensitive so it never shows in logs.
pub fn header_map(pairs: &[(&'static str, &str)]) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let mut value = HeaderValue::from_str(value)?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

/// Shared HTTP client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Same connection pool, different timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            client: self.client.clone(),
            timeout,
        }
    }

    pub async fn get(&self, url: &str, headers: &HeaderMap) -> HttpResponse {
        self.send(Method::GET, url, None, headers).await
    }

    pub async fn post(&self, url: &str, body: &Value, headers: &HeaderMap) -> HttpResponse {
        self.send(Method::POST, url, Some(body), headers).await
    }

    pub async fn put(&self, url: &str, body: &Value, headers: &HeaderMap) -> HttpResponse {
        self.send(Method::PUT, url, Some(body), headers).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &HeaderMap,
    ) -> HttpResponse {
        let mut request: RequestBuilder = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                error!(method = %method, url = %url, error = %e, "HTTP connect error");
                return HttpResponse::transport_error(e.to_string());
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                error!(method = %method, url = %url, error = %e, "Failed to read HTTP response body");
                return HttpResponse::transport_error(e.to_string());
            }
        };

        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        let result = HttpResponse {
            ok: status.is_success(),
            status: Some(status.as_u16()),
            data,
            error: None,
        };

        if !result.ok {
            if result.is_worker_maintenance() {
                info!(url = %url, "Cluster reports worker maintenance");
            } else {
                warn!(
                    method = %method,
                    url = %url,
                    status = status.as_u16(),
                    response = %result.data,
                    "HTTP server error"
                );
            }
        }

        result
    }
}
