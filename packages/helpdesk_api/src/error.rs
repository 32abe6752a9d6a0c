use std::time::Duration;

use reqwest::StatusCode;

/// Errors returned by the request executor and the typed client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The circuit breaker is open; no request was sent.
    #[error("circuit breaker is open (retry in {}s)", retry_in.as_secs())]
    CircuitOpen { retry_in: Duration },

    /// The server answered 429 and the retry budget is spent (or the call is not retry-safe).
    #[error(
        "rate limited (status {status}){}{}",
        retry_after.map(|d| format!(", retry after {}s", d.as_secs())).unwrap_or_default(),
        request_id.as_ref().map(|id| format!(", request id {id}")).unwrap_or_default()
    )]
    RateLimited {
        status: StatusCode,
        retry_after: Option<Duration>,
        request_id: Option<String>,
    },

    /// The server answered with a 4xx/5xx status.
    #[error(
        "API error {status}: {body}{}",
        request_id.as_ref().map(|id| format!(" (request id {id})")).unwrap_or_default()
    )]
    Api {
        status: StatusCode,
        /// Sanitized error body, see [`crate::sanitize::sanitize_error_body`].
        body: String,
        request_id: Option<String>,
    },

    /// Network or TLS failure. Never retried.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The call was cancelled while sleeping or in flight.
    #[error("request cancelled")]
    Cancelled,

    /// A 202-accepted operation did not reach a terminal state in time.
    #[error("async operation at {location} did not finish within {}s", waited.as_secs())]
    AsyncTimeout { location: String, waited: Duration },

    /// A header value (such as the API token) contains characters HTTP does not allow.
    #[error("invalid value for header {0}")]
    InvalidHeader(String),

    /// A URL could not be built or resolved.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::RateLimited { status, .. } | ApiError::Api { status, .. } => Some(*status),
            ApiError::Transport(err) => err.status(),
            _ => None,
        }
    }

    /// Server-assigned request id, if the response carried one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ApiError::RateLimited { request_id, .. } | ApiError::Api { request_id, .. } => {
                request_id.as_deref()
            }
            _ => None,
        }
    }

    /// True for failures that may succeed if attempted again later
    /// (breaker open, rate limited, server errors).
    pub fn is_retryable_later(&self) -> bool {
        match self {
            ApiError::CircuitOpen { .. } | ApiError::RateLimited { .. } => true,
            ApiError::Api { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// True when the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
