pub mod api;
pub mod cursor;
pub mod follow;

use std::sync::Arc;

use anyhow::Result;
use helpdesk_api::{HelpdeskClient, RequestExecutor};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::FileConfig;

/// Client wired with the configured retry/breaker/wait settings. Every retry
/// sleep observes `cancel`.
pub fn build_client(config: &FileConfig, cancel: &CancellationToken) -> Result<HelpdeskClient> {
    let base_url = config.base_url()?;
    let account_id = config.account_id()?;

    let mut executor = RequestExecutor::new(config.retry.clone())?
        .with_wait(config.wait.clone())
        .with_cancellation(cancel.clone());
    match config.api_token.as_deref() {
        Some(token) => executor = executor.with_token(token)?,
        None => warn!("No api_token configured; requests will be unauthenticated"),
    }

    Ok(HelpdeskClient::new(base_url, account_id, Arc::new(executor)))
}
