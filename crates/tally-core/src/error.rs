//! Error types for the Tally data-access layer.
//!
//! Two layers are defined here:
//! - [`RequestError`] is produced by every failure path of the request executor
//!   and carries the correlation id of the request that failed.
//! - [`TallyError`] is the crate-wide error for storage, configuration and
//!   wiring failures.

use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestErrorKind {
    /// The request exceeded its deadline.
    Timeout,
    /// Transport-level failure (DNS, connection refused, reset).
    Network,
    /// HTTP 5xx.
    Server,
    /// HTTP 429.
    RateLimited,
    /// HTTP 401. Never retried; the stored credential has been invalidated.
    Unauthorized,
    /// Any other HTTP 4xx.
    Client,
    /// The request could not be built (empty path, bad URL, unserializable body).
    InvalidRequest,
    /// The response claimed JSON but could not be decoded.
    Decode,
}

impl RequestErrorKind {
    /// Classify an HTTP status that is not a success.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => RequestErrorKind::Unauthorized,
            429 => RequestErrorKind::RateLimited,
            500..=599 => RequestErrorKind::Server,
            _ => RequestErrorKind::Client,
        }
    }

    /// Whether a failure of this kind is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RequestErrorKind::Timeout
                | RequestErrorKind::Network
                | RequestErrorKind::Server
                | RequestErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestErrorKind::Timeout => "timeout",
            RequestErrorKind::Network => "network",
            RequestErrorKind::Server => "server",
            RequestErrorKind::RateLimited => "rate_limited",
            RequestErrorKind::Unauthorized => "unauthorized",
            RequestErrorKind::Client => "client",
            RequestErrorKind::InvalidRequest => "invalid_request",
            RequestErrorKind::Decode => "decode",
        };
        f.write_str(name)
    }
}

/// Typed failure of a single executed request (after retries).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RequestError {
    /// What went wrong.
    pub kind: RequestErrorKind,
    /// Human readable message, server-provided when available.
    pub message: String,
    /// HTTP status, if a response was received.
    pub status: Option<u16>,
    /// Decoded JSON error body, if the server sent one.
    pub data: Option<Value>,
    /// Correlation id shared by every log event of the request.
    pub request_id: String,
    /// Server-requested delay from a `Retry-After` header, in seconds.
    pub retry_after_secs: Option<u64>,
}

impl RequestError {
    /// Create an error without response details.
    pub fn new(
        kind: RequestErrorKind,
        message: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            data: None,
            request_id: request_id.into(),
            retry_after_secs: None,
        }
    }

    /// The `timeout` failure produced when the deadline expires.
    pub fn timeout(request_id: impl Into<String>) -> Self {
        Self::new(RequestErrorKind::Timeout, "timeout", request_id)
    }

    /// Build an error from a non-success HTTP response.
    ///
    /// A JSON body with a string `message` or `error` field provides the message.
    pub fn from_response(status: u16, data: Option<Value>, request_id: impl Into<String>) -> Self {
        let kind = RequestErrorKind::from_status(status);
        let message = data
            .as_ref()
            .and_then(server_message)
            .unwrap_or_else(|| format!("Request failed with status {}", status));

        Self {
            kind,
            message,
            status: Some(status),
            data,
            request_id: request_id.into(),
            retry_after_secs: None,
        }
    }

    /// Attach a `Retry-After` hint.
    pub fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after_secs = secs;
        self
    }

    /// Whether the retry policy may try again after this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == RequestErrorKind::Unauthorized
    }
}

fn server_message(data: &Value) -> Option<String> {
    ["message", "error"]
        .iter()
        .find_map(|field| data.get(*field).and_then(Value::as_str))
        .map(str::to_string)
}

/// Main error type for the Tally library.
#[derive(Debug, Error)]
pub enum TallyError {
    #[error(transparent)]
    Request(#[from] RequestError),

    // Durable cache errors. The offline cache logs these and never surfaces them.
    #[error("Cache read failed for {key}: {message}")]
    CacheRead { key: String, message: String },

    #[error("Cache write failed for {key}: {message}")]
    CacheWrite { key: String, message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Action '{action}' is rate limited for another {retry_in_secs}s")]
    Throttled { action: String, retry_in_secs: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        TallyError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for TallyError {
    fn from(err: rusqlite::Error) -> Self {
        TallyError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TallyError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        TallyError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// The request failure behind this error, if any.
    pub fn as_request(&self) -> Option<&RequestError> {
        match self {
            TallyError::Request(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert_eq!(RequestErrorKind::from_status(401), RequestErrorKind::Unauthorized);
        assert_eq!(RequestErrorKind::from_status(429), RequestErrorKind::RateLimited);
        assert_eq!(RequestErrorKind::from_status(503), RequestErrorKind::Server);
        assert_eq!(RequestErrorKind::from_status(404), RequestErrorKind::Client);
        assert_eq!(RequestErrorKind::from_status(422), RequestErrorKind::Client);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(RequestErrorKind::Timeout.is_transient());
        assert!(RequestErrorKind::Network.is_transient());
        assert!(RequestErrorKind::Server.is_transient());
        assert!(RequestErrorKind::RateLimited.is_transient());

        assert!(!RequestErrorKind::Unauthorized.is_transient());
        assert!(!RequestErrorKind::Client.is_transient());
        assert!(!RequestErrorKind::Decode.is_transient());
    }

    #[test]
    fn test_server_message_is_used() {
        let err = RequestError::from_response(
            400,
            Some(json!({ "message": "Amount must be positive" })),
            "req-1",
        );
        assert_eq!(err.kind, RequestErrorKind::Client);
        assert_eq!(err.to_string(), "Amount must be positive");
        assert_eq!(err.status, Some(400));
        assert_eq!(err.request_id, "req-1");

        let err = RequestError::from_response(409, Some(json!({ "error": "Duplicate" })), "req-2");
        assert_eq!(err.message, "Duplicate");
    }

    #[test]
    fn test_fallback_message() {
        let err = RequestError::from_response(502, None, "req-3");
        assert_eq!(err.message, "Request failed with status 502");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_request_error_converts() {
        let err: TallyError = RequestError::timeout("req-4").into();
        assert_eq!(err.to_string(), "timeout");
        assert_eq!(err.as_request().map(|e| e.kind), Some(RequestErrorKind::Timeout));
    }
}
