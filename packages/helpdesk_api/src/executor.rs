//! The single path every HTTP call takes.
//!
//! Per call: fail fast while the breaker is open, send, record rate-limit
//! headers, then decide by status. 429 and 5xx are retried only for
//! retry-safe calls (GET/HEAD/OPTIONS or anything carrying an idempotency
//! key); transport failures and 4xx are never retried. All sleeps race the
//! executor's cancellation token.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{ApiError, Result};
use crate::rate_limit::{self, RateLimitSnapshot};
use crate::retry::{RetryConfig, WaitConfig};
use crate::sanitize::sanitize_error_body;

/// Header carrying the user's API token.
pub const AUTH_HEADER: &str = "api_access_token";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// One HTTP call, independent of any retry state.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub idempotency_key: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            content_type: None,
            idempotency_key: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_body(mut self, body: Vec<u8>, content_type: impl Into<String>) -> Self {
        self.body = Some(body);
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.with_body(body, "application/json"))
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attach a freshly generated UUID v4 idempotency key.
    pub fn with_generated_idempotency_key(self) -> Self {
        self.with_idempotency_key(uuid::Uuid::new_v4().to_string())
    }

    fn is_safe_method(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Retry-safe: a safe method, or any method with an explicit idempotency key.
    pub fn is_idempotent(&self) -> bool {
        self.is_safe_method() || self.idempotency_key.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

pub struct RequestExecutor {
    http: reqwest::Client,
    token: Option<HeaderValue>,
    retry: RetryConfig,
    wait: WaitConfig,
    breaker: Arc<CircuitBreaker>,
    rate_limit: Mutex<Option<RateLimitSnapshot>>,
    cancel: CancellationToken,
}

impl RequestExecutor {
    pub fn new(retry: RetryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hdesk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http, retry))
    }

    pub fn with_client(http: reqwest::Client, retry: RetryConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            retry.circuit_breaker_threshold,
            retry.circuit_breaker_reset(),
        ));
        Self {
            http,
            token: None,
            retry,
            wait: WaitConfig::default(),
            breaker,
            rate_limit: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_token(mut self, token: &str) -> Result<Self> {
        let mut value = HeaderValue::from_str(token)
            .map_err(|_| ApiError::InvalidHeader(AUTH_HEADER.to_string()))?;
        value.set_sensitive(true);
        self.token = Some(value);
        Ok(self)
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the retry policy; breaker thresholds follow immediately.
    pub fn set_retry_config(&mut self, retry: RetryConfig) {
        self.breaker.set_threshold(retry.circuit_breaker_threshold);
        self.breaker.set_reset_time(retry.circuit_breaker_reset());
        self.retry = retry;
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Most recent rate-limit headers seen on any response.
    pub fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        self.rate_limit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let response = self.run(request).await?;
        if self.wait.enabled && response.status == StatusCode::ACCEPTED {
            if let Some(location) = location(&response.headers) {
                return self.wait_for(&request.url, &location).await;
            }
        }
        Ok(response)
    }

    /// Attempt loop without 202 handling.
    async fn run(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let idempotent = request.is_idempotent();
        let mut rate_limit_attempts = 0u32;
        let mut server_error_attempts = 0u32;

        loop {
            if let Some(retry_in) = self.breaker.retry_in() {
                return Err(ApiError::CircuitOpen { retry_in });
            }

            let response = self.send_once(request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            self.record_rate_limit(&headers);
            debug!(method = %request.method, url = %request.url, status = %status, "response");

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = rate_limit::retry_after(&headers);
                if idempotent && rate_limit_attempts < self.retry.max_rate_limit_retries {
                    let delay = retry_after
                        .unwrap_or_else(|| self.retry.rate_limit_backoff(rate_limit_attempts));
                    rate_limit_attempts += 1;
                    warn!(
                        attempt = rate_limit_attempts,
                        delay_ms = delay.as_millis() as u64,
                        url = %request.url,
                        "rate limited, retrying"
                    );
                    self.sleep(delay).await?;
                    continue;
                }
                return Err(ApiError::RateLimited {
                    status,
                    retry_after,
                    request_id: rate_limit::request_id(&headers),
                });
            }

            if status.is_server_error() {
                self.breaker.record_failure();
                if idempotent && server_error_attempts < self.retry.max_5xx_retries {
                    server_error_attempts += 1;
                    let delay = self.retry.server_error_retry_delay();
                    warn!(
                        attempt = server_error_attempts,
                        status = %status,
                        delay_ms = delay.as_millis() as u64,
                        url = %request.url,
                        "server error, retrying"
                    );
                    self.sleep(delay).await?;
                    continue;
                }
            }

            let body = self.read_body(response).await?;

            if status.is_client_error() || status.is_server_error() {
                return Err(ApiError::Api {
                    status,
                    body: sanitize_error_body(&body),
                    request_id: rate_limit::request_id(&headers),
                });
            }

            self.breaker.record_success();
            return Ok(ApiResponse {
                status,
                headers,
                body,
            });
        }
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTH_HEADER, token.clone());
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.as_str());
        }
        if let Some(key) = &request.idempotency_key {
            if !request.is_safe_method() {
                builder = builder.header(IDEMPOTENCY_HEADER, key.as_str());
            }
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            result = builder.send() => Ok(result?),
        }
    }

    async fn read_body(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            result = response.bytes() => Ok(result?.to_vec()),
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        if let Some(snapshot) = RateLimitSnapshot::from_headers(headers) {
            *self.rate_limit.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        }
    }

    /// Poll `first_location` until it stops answering 202 or the wait budget runs out.
    async fn wait_for(&self, origin: &str, first_location: &str) -> Result<ApiResponse> {
        let started = Instant::now();
        let deadline = started + self.wait.timeout();
        let mut target = resolve(origin, first_location)?;

        loop {
            if Instant::now() + self.wait.interval() > deadline {
                return Err(ApiError::AsyncTimeout {
                    location: target,
                    waited: started.elapsed(),
                });
            }
            self.sleep(self.wait.interval()).await?;

            debug!(location = %target, "polling async operation");
            let response = self.run(&ApiRequest::get(target.clone())).await?;
            if response.status != StatusCode::ACCEPTED {
                return Ok(response);
            }
            if let Some(next) = location(&response.headers) {
                target = resolve(&target, &next)?;
            }
        }
    }
}

fn location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn resolve(base: &str, location: &str) -> Result<String> {
    let base = Url::parse(base).map_err(|e| ApiError::InvalidUrl(format!("{base}: {e}")))?;
    base.join(location)
        .map(String::from)
        .map_err(|e| ApiError::InvalidUrl(format!("{location}: {e}")))
}
