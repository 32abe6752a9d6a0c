use std::future::Future;

use helpdesk_api::models::{Contact, Conversation, Message};
use helpdesk_api::{ApiError, HelpdeskClient};

/// REST lookups the follower needs for metadata hydration and snapshots.
pub trait ConversationSource {
    fn fetch_conversation(
        &self,
        conversation_id: u64,
    ) -> impl Future<Output = Result<Conversation, ApiError>>;

    fn fetch_contact(&self, contact_id: u64) -> impl Future<Output = Result<Contact, ApiError>>;

    /// Oldest first, at most `limit` messages over at most `max_pages` pages.
    fn fetch_recent_messages(
        &self,
        conversation_id: u64,
        limit: usize,
        max_pages: usize,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>>;

    fn fetch_labels(&self, conversation_id: u64)
    -> impl Future<Output = Result<Vec<String>, ApiError>>;
}

impl ConversationSource for HelpdeskClient {
    async fn fetch_conversation(&self, conversation_id: u64) -> Result<Conversation, ApiError> {
        self.get_conversation(conversation_id).await
    }

    async fn fetch_contact(&self, contact_id: u64) -> Result<Contact, ApiError> {
        self.get_contact(contact_id).await
    }

    async fn fetch_recent_messages(
        &self,
        conversation_id: u64,
        limit: usize,
        max_pages: usize,
    ) -> Result<Vec<Message>, ApiError> {
        self.list_recent_messages(conversation_id, limit, max_pages)
            .await
    }

    async fn fetch_labels(&self, conversation_id: u64) -> Result<Vec<String>, ApiError> {
        self.list_conversation_labels(conversation_id).await
    }
}
