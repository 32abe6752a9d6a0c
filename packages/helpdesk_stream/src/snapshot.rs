//! First-sight conversation snapshots.

use helpdesk_api::ApiError;
use helpdesk_api::models::{Contact, Conversation, Message};
use serde::Serialize;
use tracing::debug;

use crate::source::ConversationSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLimits {
    pub messages: usize,
    pub max_pages: usize,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            messages: 20,
            max_pages: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub conversation_id: u64,
    pub conversation: Conversation,
    pub contact: Option<Contact>,
    pub messages: Vec<Message>,
}

/// Conversation, its contact and the most recent messages. Any failing
/// lookup fails the whole snapshot.
pub async fn take_snapshot<S: ConversationSource>(
    source: &S,
    conversation_id: u64,
    limits: SnapshotLimits,
) -> Result<Snapshot, ApiError> {
    let conversation = source.fetch_conversation(conversation_id).await?;
    let contact = match conversation.contact_id() {
        Some(contact_id) => Some(source.fetch_contact(contact_id).await?),
        None => None,
    };
    let messages = if limits.messages == 0 {
        Vec::new()
    } else {
        source
            .fetch_recent_messages(conversation_id, limits.messages, limits.max_pages)
            .await?
    };
    debug!(conversation_id, messages = messages.len(), "snapshot taken");
    Ok(Snapshot {
        conversation_id,
        conversation,
        contact,
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fake::FakeSource;

    fn message(id: u64) -> Message {
        Message {
            id,
            conversation_id: 1,
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn bundles_conversation_contact_and_recent_messages() {
        let mut source = FakeSource::default().with_conversation(1, 2, "open", None);
        source.contacts.insert(
            101,
            Contact {
                id: 101,
                name: Some("Grace".into()),
                ..Contact::default()
            },
        );
        source.messages.insert(1, (1..=30).map(message).collect());

        let snap = take_snapshot(&source, 1, SnapshotLimits::default())
            .await
            .unwrap();
        assert_eq!(snap.conversation.inbox_id, 2);
        assert_eq!(snap.contact.unwrap().name.as_deref(), Some("Grace"));
        assert_eq!(snap.messages.len(), 20);
        assert_eq!(snap.messages.first().unwrap().id, 11);
    }

    #[tokio::test]
    async fn missing_contact_fails_the_snapshot() {
        let source = FakeSource::default().with_conversation(1, 2, "open", None);
        let err = take_snapshot(&source, 1, SnapshotLimits::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
