//! JSON-lines output records.

use chrono::{DateTime, Utc};
use helpdesk_api::models::Message;
use serde::Serialize;
use serde_json::Value;

use crate::debounce::Batch;
use crate::router::MESSAGE_CREATED;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    Message {
        event: String,
        conversation_id: u64,
        message: Message,
    },
    Batch {
        conversation_id: u64,
        count: usize,
        first_created_at: i64,
        last_created_at: i64,
        message_ids: Vec<u64>,
        content: String,
        /// The message a one-line display would show.
        latest: Message,
        messages: Vec<Message>,
    },
    Event {
        event: String,
        data: Value,
    },
    Snapshot(Box<Snapshot>),
    SnapshotError {
        conversation_id: u64,
        error: String,
    },
    Status {
        state: SessionState,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Disconnected,
}

impl OutputRecord {
    pub fn message(event: String, message: Message) -> Self {
        OutputRecord::Message {
            event,
            conversation_id: message.conversation_id,
            message,
        }
    }

    /// A batch of one is written as a plain message record.
    pub fn from_batch(mut batch: Batch) -> Option<Self> {
        match batch.messages.len() {
            0 => None,
            1 => batch
                .messages
                .pop()
                .map(|m| Self::message(MESSAGE_CREATED.to_string(), m)),
            count => {
                let latest = batch.newest().cloned().unwrap_or_default();
                Some(OutputRecord::Batch {
                    conversation_id: batch.conversation_id,
                    count,
                    first_created_at: batch.first_created_at(),
                    last_created_at: batch.last_created_at(),
                    message_ids: batch.message_ids(),
                    content: batch.content(),
                    latest,
                    messages: batch.messages,
                })
            }
        }
    }

    pub fn status(state: SessionState, attempt: u32, error: Option<String>) -> Self {
        OutputRecord::Status {
            state,
            attempt,
            error,
            at: Utc::now(),
        }
    }
}
