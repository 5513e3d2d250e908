//! Request executor: the single entry point for REST calls.
//!
//! Wraps an [`HttpTransport`] with:
//! - Base URL resolution and JSON headers
//! - Identity header from the [`AuthSession`]
//! - Per-attempt timeout
//! - Retry with exponential backoff for transient failures
//! - Credential invalidation on HTTP 401
//! - Rate limit tracking from response headers

use crate::auth::{AuthHeader, AuthSession};
use crate::config::{ClientConfig, NetworkConfig};
use crate::error::{RequestError, RequestErrorKind, Result, TallyError};
use crate::network::retry::{retry_async, AttemptOutcome, RetryConfig, RetryHint};
use crate::network::transport::{
    DynTransport, HttpRequest, HttpResponse, ReqwestTransport, TransportError,
};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error, Instrument};
use url::Url;
use uuid::Uuid;

/// Rate limit state extracted from response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// Remaining requests allowed.
    pub remaining: Option<u64>,
    /// Total request limit.
    pub limit: Option<u64>,
    /// When the server-side quota resets.
    pub reset: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// Whether the quota is nearly used up (below 10% of the limit).
    pub fn is_near_limit(&self) -> bool {
        match (self.remaining, self.limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                let threshold = (limit as f64 * 0.1) as u64;
                remaining < threshold.max(1)
            }
            _ => false,
        }
    }
}

impl RetryHint for RequestError {
    fn retry_after(&self) -> Option<Duration> {
        self.retry_after_secs.map(Duration::from_secs)
    }
}

/// Executes REST calls against the Tally backend.
pub struct RequestExecutor {
    transport: DynTransport,
    auth: Arc<AuthSession>,
    base_url: Url,
    timeout: Duration,
    retry: RetryConfig,
    rate_limit_remaining: AtomicI64,
    rate_limit_limit: AtomicU64,
    rate_limit_reset: AtomicI64,
}

impl RequestExecutor {
    /// Create an executor with default timeout and retry settings.
    pub fn new(base_url: &str, transport: DynTransport, auth: Arc<AuthSession>) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| TallyError::Validation {
            field: "api_base_url".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            transport,
            auth,
            base_url,
            timeout: NetworkConfig::DEV_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
            rate_limit_remaining: AtomicI64::new(-1),
            rate_limit_limit: AtomicU64::new(0),
            rate_limit_reset: AtomicI64::new(0),
        })
    }

    /// Create a reqwest-backed executor from configuration.
    pub fn from_config(config: &ClientConfig, auth: Arc<AuthSession>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new()?);
        Ok(Self::new(&config.api_base_url, transport, auth)?
            .with_timeout(config.request_timeout())
            .with_retry(config.retry_config()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Server-side quota as last reported by response headers.
    pub fn last_rate_limit(&self) -> RateLimitState {
        let remaining = self.rate_limit_remaining.load(Ordering::SeqCst);
        let limit = self.rate_limit_limit.load(Ordering::SeqCst);
        let reset = self.rate_limit_reset.load(Ordering::SeqCst);

        RateLimitState {
            remaining: (remaining >= 0).then_some(remaining as u64),
            limit: (limit > 0).then_some(limit),
            reset: (reset > 0)
                .then(|| Utc.timestamp_opt(reset, 0).single())
                .flatten(),
        }
    }

    /// Execute one logical request.
    ///
    /// Returns the decoded JSON body on success, or `None` when the response
    /// carries no JSON.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        headers: &[(String, String)],
    ) -> std::result::Result<Option<Value>, RequestError> {
        let request_id = Uuid::new_v4().to_string();
        let span = debug_span!("request", request_id = %request_id, method = %method, path);

        self.execute_inner(method, path, body, headers, &request_id)
            .instrument(span)
            .await
    }

    /// Execute and decode the payload under the same request id.
    async fn execute_decoded<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<T, RequestError> {
        let request_id = Uuid::new_v4().to_string();
        let span = debug_span!("request", request_id = %request_id, method = %method, path);

        async {
            self.execute_inner(method, path, body, &[], &request_id)
                .await
                .and_then(|payload| decode_payload(payload, path, &request_id))
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        overrides: &[(String, String)],
        request_id: &str,
    ) -> std::result::Result<Option<Value>, RequestError> {
        if path.trim().is_empty() {
            error!(request_id, "Rejected request with empty path");
            return Err(RequestError::new(
                RequestErrorKind::InvalidRequest,
                "Request path must not be empty",
                request_id,
            ));
        }

        let url = self.resolve_url(path).map_err(|e| {
            error!(request_id, "Rejected request path {}: {}", path, e);
            RequestError::new(
                RequestErrorKind::InvalidRequest,
                format!("Invalid request path {}: {}", path, e),
                request_id,
            )
        })?;

        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| {
                RequestError::new(
                    RequestErrorKind::InvalidRequest,
                    format!("Failed to serialize request body: {}", e),
                    request_id,
                )
            })?;

        let (headers, identity) = self.build_headers(overrides);
        let request = HttpRequest {
            method,
            url: url.to_string(),
            headers,
            body,
        };
        let sent_token = match &identity {
            AuthHeader::Bearer(token) => Some(token.as_str()),
            _ => None,
        };

        debug!(request_id, "Starting request");
        let started = Instant::now();
        let request = &request;

        let (result, stats) = retry_async(&self.retry, |attempt| {
            self.attempt(request.clone(), attempt, request_id, sent_token)
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(
                request_id,
                attempts = stats.attempts,
                elapsed_ms,
                "Request succeeded"
            ),
            Err(e) => error!(
                request_id,
                attempts = stats.attempts,
                elapsed_ms,
                kind = %e.kind,
                status = e.status,
                "Request failed: {}",
                e
            ),
        }

        result
    }

    /// One attempt: send with a deadline and classify the outcome.
    async fn attempt(
        &self,
        request: HttpRequest,
        attempt: u32,
        request_id: &str,
        sent_token: Option<&str>,
    ) -> AttemptOutcome<Option<Value>, RequestError> {
        let started = Instant::now();

        let response = match tokio::time::timeout(self.timeout, self.transport.send(request)).await
        {
            Err(_) | Ok(Err(TransportError::Timeout)) => {
                return AttemptOutcome::TransientFailure(RequestError::timeout(request_id));
            }
            Ok(Err(e)) => {
                return AttemptOutcome::TransientFailure(RequestError::new(
                    RequestErrorKind::Network,
                    e.to_string(),
                    request_id,
                ));
            }
            Ok(Ok(response)) => response,
        };

        debug!(
            request_id,
            attempt,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Response received"
        );

        self.update_rate_limits(&response);

        if response.is_success() {
            return match parse_json_body(&response, request_id) {
                Ok(payload) => AttemptOutcome::Success(payload),
                Err(e) => AttemptOutcome::FatalFailure(e),
            };
        }

        let data = if response.is_json() {
            serde_json::from_slice(&response.body).ok()
        } else {
            None
        };
        let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let err = RequestError::from_response(response.status, data, request_id)
            .with_retry_after(retry_after);

        if err.is_unauthorized() {
            self.auth.invalidate_if_current(sent_token);
            return AttemptOutcome::FatalFailure(err);
        }

        if err.is_retryable() {
            AttemptOutcome::TransientFailure(err)
        } else {
            AttemptOutcome::FatalFailure(err)
        }
    }

    /// GET returning the raw payload.
    pub async fn get(&self, path: &str) -> std::result::Result<Option<Value>, RequestError> {
        self.execute(Method::GET, path, None, &[]).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
    ) -> std::result::Result<Option<Value>, RequestError> {
        self.execute(Method::POST, path, Some(body), &[]).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: &Value,
    ) -> std::result::Result<Option<Value>, RequestError> {
        self.execute(Method::PUT, path, Some(body), &[]).await
    }

    pub async fn delete(&self, path: &str) -> std::result::Result<Option<Value>, RequestError> {
        self.execute(Method::DELETE, path, None, &[]).await
    }

    /// GET and decode the payload into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> std::result::Result<T, RequestError> {
        self.execute_decoded(Method::GET, path, None).await
    }

    /// Send a serializable body and decode the payload into `T`.
    pub async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> std::result::Result<T, RequestError> {
        let body = serde_json::to_value(body).map_err(|e| {
            let request_id = Uuid::new_v4().to_string();
            error!(request_id = %request_id, path, "Failed to serialize request body: {}", e);
            RequestError::new(
                RequestErrorKind::InvalidRequest,
                format!("Failed to serialize request body: {}", e),
                request_id,
            )
        })?;
        self.execute_decoded(method, path, Some(&body)).await
    }

    // Internal methods

    /// Join `path` onto the backend URL; anything that escapes its origin is refused.
    fn resolve_url(&self, path: &str) -> std::result::Result<Url, String> {
        let url = self.base_url.join(path).map_err(|e| e.to_string())?;
        if url.origin() != self.base_url.origin() {
            return Err(format!(
                "{} is outside {}",
                url.origin().ascii_serialization(),
                self.base_url
            ));
        }
        Ok(url)
    }

    fn build_headers(
        &self,
        overrides: &[(String, String)],
    ) -> (Vec<(String, String)>, AuthHeader) {
        let mut headers = vec![
            (
                "Content-Type".to_string(),
                NetworkConfig::JSON_CONTENT_TYPE.to_string(),
            ),
            (
                "Accept".to_string(),
                NetworkConfig::JSON_CONTENT_TYPE.to_string(),
            ),
        ];
        let mut caller_dev_user = None;

        for (name, value) in overrides {
            if name.eq_ignore_ascii_case(NetworkConfig::DEV_USER_HEADER) {
                caller_dev_user = Some(value.as_str());
                continue;
            }
            // Identity comes from the session only.
            if name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }

        let identity = self.auth.resolve(caller_dev_user);
        if let Some(header) = identity.to_header() {
            headers.push(header);
        }

        (headers, identity)
    }

    fn update_rate_limits(&self, response: &HttpResponse) {
        if let Some(num) = response
            .header("X-RateLimit-Remaining")
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.rate_limit_remaining.store(num, Ordering::SeqCst);
        }

        if let Some(num) = response
            .header("X-RateLimit-Limit")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.rate_limit_limit.store(num, Ordering::SeqCst);
        }

        if let Some(num) = response
            .header("X-RateLimit-Reset")
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.rate_limit_reset.store(num, Ordering::SeqCst);
        }
    }
}

fn parse_json_body(
    response: &HttpResponse,
    request_id: &str,
) -> std::result::Result<Option<Value>, RequestError> {
    if !response.is_json() || response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice(&response.body).map(Some).map_err(|e| {
        let mut err = RequestError::new(
            RequestErrorKind::Decode,
            format!("Failed to decode response body: {}", e),
            request_id,
        );
        err.status = Some(response.status);
        err
    })
}

fn decode_payload<T: DeserializeOwned>(
    payload: Option<Value>,
    path: &str,
    request_id: &str,
) -> std::result::Result<T, RequestError> {
    let value = payload.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        error!(request_id, "Unexpected payload from {}: {}", path, e);
        RequestError::new(
            RequestErrorKind::Decode,
            format!("Unexpected payload from {}: {}", path, e),
            request_id,
        )
    })
}
