use std::sync::Arc;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Result;
use crate::executor::{ApiRequest, ApiResponse, RequestExecutor};
use crate::models::{Contact, Conversation, Message, Payload};

/// Account-scoped REST client. Every call goes through the shared executor.
#[derive(Clone)]
pub struct HelpdeskClient {
    base_url: String,
    account_id: u64,
    executor: Arc<RequestExecutor>,
}

impl HelpdeskClient {
    pub fn new(base_url: &str, account_id: u64, executor: Arc<RequestExecutor>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id,
            executor,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn account_id(&self) -> u64 {
        self.account_id
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    /// `{base}/api/v1/accounts/{account}/{path}`; absolute URLs pass through.
    pub fn account_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/api/v1/accounts/{}/{}",
            self.base_url,
            self.account_id,
            path.trim_start_matches('/')
        )
    }

    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.executor.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute(&ApiRequest::get(self.account_url(path)))
            .await?
            .json()
    }

    pub async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<T> {
        let mut request = ApiRequest::new(method, self.account_url(path)).with_json(body)?;
        if let Some(key) = idempotency_key {
            request = request.with_idempotency_key(key);
        }
        self.execute(&request).await?.json()
    }

    pub async fn get_conversation(&self, conversation_id: u64) -> Result<Conversation> {
        self.get_json(&format!("conversations/{conversation_id}"))
            .await
    }

    pub async fn get_contact(&self, contact_id: u64) -> Result<Contact> {
        // Contact show responses are wrapped in {"payload": {...}}
        let response = self
            .execute(&ApiRequest::get(
                self.account_url(&format!("contacts/{contact_id}")),
            ))
            .await?;
        match response.json::<Payload<Contact>>() {
            Ok(wrapped) => Ok(wrapped.payload),
            Err(_) => response.json(),
        }
    }

    pub async fn list_conversation_labels(&self, conversation_id: u64) -> Result<Vec<String>> {
        let labels: Payload<Vec<String>> = self
            .get_json(&format!("conversations/{conversation_id}/labels"))
            .await?;
        Ok(labels.payload)
    }

    /// Up to `limit` most recent messages, oldest first, fetching at most
    /// `max_pages` pages (the server pages backwards with `before=<id>`).
    pub async fn list_recent_messages(
        &self,
        conversation_id: u64,
        limit: usize,
        max_pages: usize,
    ) -> Result<Vec<Message>> {
        let mut collected: Vec<Message> = Vec::new();
        let mut before: Option<u64> = None;

        for page in 0..max_pages {
            if collected.len() >= limit {
                break;
            }
            let path = match before {
                Some(id) => format!("conversations/{conversation_id}/messages?before={id}"),
                None => format!("conversations/{conversation_id}/messages"),
            };
            let batch: Payload<Vec<Message>> = self.get_json(&path).await?;
            debug!(conversation_id, page, count = batch.payload.len(), "fetched message page");

            let Some(oldest) = batch.payload.iter().map(|m| m.id).min() else {
                break;
            };
            if before.is_some_and(|b| oldest >= b) {
                // Server ignored the cursor; stop rather than loop on the same page
                break;
            }
            before = Some(oldest);
            collected.extend(batch.payload);
        }

        collected.sort_by_key(|m| m.id);
        collected.dedup_by_key(|m| m.id);
        let skip = collected.len().saturating_sub(limit);
        Ok(collected.split_off(skip))
    }
}

impl std::fmt::Debug for HelpdeskClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelpdeskClient")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .finish()
    }
}
