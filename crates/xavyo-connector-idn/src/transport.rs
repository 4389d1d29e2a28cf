//! Outbound HTTP with credential injection and bounded retry.
//!
//! Every covered write (member add/remove, capability replace, lifecycle
//! state set, account toggle) has replace/set semantics upstream, so a retry
//! after an ambiguous failure cannot double-apply.

use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::auth::{CredentialBroker, CredentialKind};
use crate::retry::RetryPolicy;
use crate::{IdnError, IdnResult};

/// Header carrying the total number of matching records.
pub const TOTAL_COUNT_HEADER: &str = "X-Total-Count";

/// Content type for JSON-patch documents.
pub const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// Body of an outbound request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A request as seen by the transport.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub credential: CredentialKind,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Overrides the body's default content type.
    pub content_type: Option<&'static str>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            credential: CredentialKind::Api,
            query: Vec::new(),
            body: None,
            content_type: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    #[must_use]
    pub fn credential(mut self, kind: CredentialKind) -> Self {
        self.credential = kind;
        self
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// JSON-patch body (`application/json-patch+json`).
    #[must_use]
    pub fn json_patch(mut self, operations: Value) -> Self {
        self.content_type = Some(JSON_PATCH_CONTENT_TYPE);
        self.body = Some(RequestBody::Json(operations));
        self
    }

    #[must_use]
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }

    fn operation(&self) -> String {
        let path = url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.url.clone());
        format!("{} {}", self.method, path)
    }
}

/// A successful upstream response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl ApiResponse {
    /// Total count declared by the upstream, if present.
    #[must_use]
    pub fn total_count(&self) -> Option<u64> {
        self.headers
            .get(TOTAL_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Deserializes the body.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Json` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(self) -> IdnResult<T> {
        Ok(serde_json::from_value(self.body)?)
    }

    /// Body as a list of records. A non-array body is an error.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::InvalidResponse` if the body is not an array.
    pub fn into_records(self) -> IdnResult<Vec<Value>> {
        match self.body {
            Value::Array(records) => Ok(records),
            Value::Null => Ok(Vec::new()),
            other => Err(IdnError::InvalidResponse(format!(
                "Expected a JSON array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct TransportMetrics {
    /// Requests that completed with a success status.
    pub successful_requests: u64,
    /// Requests that surfaced an error to the caller.
    pub failed_requests: u64,
    /// 429 responses received.
    pub rate_limited_count: u64,
    /// Retry attempts made.
    pub retry_count: u64,
}

/// Wraps outbound calls with credential injection and bounded retry.
#[derive(Debug)]
pub struct RetryingTransport {
    http_client: reqwest::Client,
    broker: Arc<CredentialBroker>,
    policy: RetryPolicy,
    metrics: Arc<RwLock<TransportMetrics>>,
}

impl RetryingTransport {
    pub fn new(http_client: reqwest::Client, broker: Arc<CredentialBroker>, policy: RetryPolicy) -> Self {
        Self {
            http_client,
            broker,
            policy,
            metrics: Arc::new(RwLock::new(TransportMetrics::default())),
        }
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns a snapshot of the counters.
    pub async fn metrics(&self) -> TransportMetrics {
        self.metrics.read().await.clone()
    }

    /// Executes a request, retrying transient failures.
    ///
    /// # Errors
    ///
    /// - `IdnError::Authentication` if the API token cannot be obtained.
    /// - `IdnError::Authorization` on 401/403.
    /// - `IdnError::Api` / `IdnError::Network` carrying the attempt count once
    ///   retries are exhausted or the failure is not retryable.
    #[instrument(skip(self, request), fields(operation = %request.operation()))]
    pub async fn execute(&self, request: ApiRequest) -> IdnResult<ApiResponse> {
        let mut attempt = 0u32;
        let mut reauthenticated = false;

        loop {
            attempt += 1;
            let retries_used = attempt - 1;

            let token = self.broker.token_for(request.credential).await?;
            let response = self.send_once(&request, token.as_deref()).await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        let headers = resp.headers().clone();
                        let text = resp.text().await.map_err(|e| IdnError::Network {
                            message: format!("Failed to read response body: {e}"),
                            attempts: attempt,
                            source: e,
                        })?;
                        let body = if text.trim().is_empty() {
                            Value::Null
                        } else {
                            serde_json::from_str(&text)?
                        };
                        self.metrics.write().await.successful_requests += 1;
                        return Ok(ApiResponse {
                            status,
                            headers,
                            body,
                        });
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        self.metrics.write().await.rate_limited_count += 1;
                    }

                    // A rejected credential is refreshed once before giving up.
                    // Without a privileged session there is nothing to refresh.
                    if status == StatusCode::UNAUTHORIZED
                        && !reauthenticated
                        && (request.credential == CredentialKind::Api || token.is_some())
                    {
                        debug!(credential = ?request.credential, "Credential rejected, refreshing");
                        reauthenticated = true;
                        self.broker.invalidate(request.credential).await;
                        continue;
                    }

                    if self.policy.should_retry(status.as_u16())
                        && retries_used < self.policy.max_retries
                    {
                        let retry_after = resp
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(RetryPolicy::parse_retry_after);
                        let delay = self.policy.delay_for(retries_used, retry_after);

                        warn!(
                            status = %status,
                            attempt = attempt,
                            max_retries = self.policy.max_retries,
                            wait_ms = delay.as_millis() as u64,
                            "Transient upstream error, retrying"
                        );
                        self.metrics.write().await.retry_count += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    self.metrics.write().await.failed_requests += 1;
                    return Err(status_error(&request, status, &body, attempt));
                }
                Err(e) => {
                    let transient = e.is_timeout() || e.is_connect() || e.is_request();
                    if transient && retries_used < self.policy.max_retries {
                        let delay = self.policy.delay_for(retries_used, None);
                        warn!(
                            error = %e,
                            attempt = attempt,
                            wait_ms = delay.as_millis() as u64,
                            "Request failed, retrying"
                        );
                        self.metrics.write().await.retry_count += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.metrics.write().await.failed_requests += 1;
                    return Err(IdnError::Network {
                        message: format!("{} failed: {e}", request.operation()),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .http_client
            .request(request.method.clone(), &request.url)
            .header(ACCEPT, "application/json");

        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        match request.body {
            Some(RequestBody::Json(ref body)) => builder = builder.json(body),
            Some(RequestBody::Form(ref fields)) => builder = builder.form(fields),
            None => {}
        }

        builder.send().await
    }
}

/// Maps a non-success status to the error taxonomy.
fn status_error(request: &ApiRequest, status: StatusCode, body: &str, attempts: u32) -> IdnError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => IdnError::Authorization {
            operation: request.operation(),
            status: status.as_u16(),
        },
        _ => IdnError::Api {
            status: status.as_u16(),
            message: upstream_message(body),
            attempts,
        },
    }
}

/// Extracts the human-readable message from an upstream error body.
fn upstream_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };

    json.get("messages")
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
        .and_then(|m| m.get("text"))
        .or_else(|| json.get("message"))
        .or_else(|| json.get("error_description"))
        .or_else(|| json.get("error"))
        .and_then(|v| v.as_str())
        .map_or_else(|| body.to_string(), String::from)
}
