//! # helpdesk_api
//!
//! Resilient access to the helpdesk REST API.
//!
//! Every HTTP call goes through [`RequestExecutor`], which layers on top of
//! `reqwest`:
//! - a consecutive-failure [`CircuitBreaker`] that fails fast without I/O,
//! - bounded retries for 429 (honoring `Retry-After`) and 5xx, only for
//!   retry-safe calls,
//! - `Idempotency-Key` handling,
//! - optional polling of `202 Accepted` + `Location` operations,
//! - sanitized error bodies and a last-seen rate-limit snapshot.
//!
//! [`HelpdeskClient`] adds the account-scoped typed operations the real-time
//! follower needs: conversations, contacts, labels and recent messages.
//!
//! ```no_run
//! use std::sync::Arc;
//! use helpdesk_api::{HelpdeskClient, RequestExecutor, RetryConfig};
//!
//! # async fn run() -> helpdesk_api::Result<()> {
//! let executor = RequestExecutor::new(RetryConfig::default())?.with_token("token")?;
//! let client = HelpdeskClient::new("https://desk.example.com", 1, Arc::new(executor));
//! let conversation = client.get_conversation(42).await?;
//! println!("{} is {}", conversation.id, conversation.status);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
mod client;
mod error;
mod executor;
pub mod models;
pub mod rate_limit;
mod retry;
pub mod sanitize;

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::HelpdeskClient;
pub use error::{ApiError, Result};
pub use executor::{ApiRequest, ApiResponse, AUTH_HEADER, IDEMPOTENCY_HEADER, RequestExecutor};
pub use rate_limit::RateLimitSnapshot;
pub use retry::{RetryConfig, WaitConfig};

pub use reqwest::{Method, StatusCode};
