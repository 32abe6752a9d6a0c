//! Frame decoding, filtering and metadata maintenance.
//!
//! The router sees every frame in arrival order. Message events go through
//! the filter chain (scope, since, dedup, direction, privacy, metadata);
//! conversation and label events patch the [`MetaCache`] so metadata filters
//! stay correct without refetching.

use std::collections::HashSet;

use helpdesk_api::models::Message;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::meta::{ConversationMeta, MetaCache};
use crate::snapshot::{Snapshot, SnapshotLimits, take_snapshot};
use crate::source::ConversationSource;

pub const MESSAGE_CREATED: &str = "message.created";
pub const MESSAGE_UPDATED: &str = "message.updated";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssigneeFilter {
    Unassigned,
    User(u64),
}

impl std::str::FromStr for AssigneeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "unassigned" => Ok(AssigneeFilter::Unassigned),
            other => other
                .parse()
                .map(AssigneeFilter::User)
                .map_err(|_| format!("expected a user id or \"none\", got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    /// Event names to pass; empty passes everything.
    pub events: Vec<String>,
    /// Single-conversation mode.
    pub conversation_id: Option<u64>,
    /// Unix seconds; older messages are dropped.
    pub min_created_at: Option<i64>,
    pub incoming_only: bool,
    pub include_private: bool,
    pub inbox_id: Option<u64>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee: Option<AssigneeFilter>,
    /// Every listed label must be present.
    pub labels: Vec<String>,
}

impl FilterConfig {
    pub fn allows_event(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == event)
    }

    pub fn needs_metadata(&self) -> bool {
        self.inbox_id.is_some()
            || self.status.is_some()
            || self.priority.is_some()
            || self.assignee.is_some()
            || !self.labels.is_empty()
    }

    fn matches_meta(&self, meta: &ConversationMeta) -> bool {
        if self.inbox_id.is_some_and(|inbox| inbox != meta.inbox_id) {
            return false;
        }
        if self.status.as_ref().is_some_and(|s| *s != meta.status) {
            return false;
        }
        if self
            .priority
            .as_ref()
            .is_some_and(|p| meta.priority.as_ref() != Some(p))
        {
            return false;
        }
        match &self.assignee {
            Some(AssigneeFilter::Unassigned) if meta.assignee_id.is_some() => return false,
            Some(AssigneeFilter::User(id)) if meta.assignee_id != Some(*id) => return false,
            _ => {}
        }
        self.labels.iter().all(|label| meta.labels.contains(label))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// What the follower should do with one decoded frame.
#[derive(Debug, Clone)]
pub enum RoutedEvent {
    Message { event: String, message: Message },
    Event { event: String, data: Value },
    Snapshot(Box<Snapshot>),
    SnapshotError { conversation_id: u64, error: String },
}

pub struct EventRouter<S> {
    source: S,
    filter: FilterConfig,
    cache: MetaCache,
    last_seen: u64,
    snapshot: Option<SnapshotLimits>,
    snapshotted: HashSet<u64>,
}

impl<S: ConversationSource> EventRouter<S> {
    pub fn new(source: S, filter: FilterConfig) -> Self {
        Self {
            source,
            filter,
            cache: MetaCache::new(),
            last_seen: 0,
            snapshot: None,
            snapshotted: HashSet::new(),
        }
    }

    /// Seed dedup with a resumed position. Never moves backwards.
    pub fn with_last_seen(mut self, last_seen: u64) -> Self {
        self.last_seen = self.last_seen.max(last_seen);
        self
    }

    pub fn with_snapshots(mut self, limits: SnapshotLimits) -> Self {
        self.snapshot = Some(limits);
        self
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn cache(&self) -> &MetaCache {
        &self.cache
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Decode and filter one raw frame. Undecodable frames yield nothing.
    pub async fn route(&mut self, frame: &str) -> Vec<RoutedEvent> {
        let envelope: Envelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "skipping undecodable frame");
                return Vec::new();
            }
        };

        if envelope.event == MESSAGE_CREATED || envelope.event == MESSAGE_UPDATED {
            return self.route_message(envelope).await;
        }

        // Cache upkeep happens for every event, allowed or not
        self.cache.apply_event(&envelope.event, &envelope.data);

        if !self.filter.allows_event(&envelope.event) {
            return Vec::new();
        }
        if let Some(scope) = self.filter.conversation_id {
            let id = envelope
                .data
                .get("conversation_id")
                .or_else(|| envelope.data.get("id"))
                .and_then(Value::as_u64);
            if id != Some(scope) {
                return Vec::new();
            }
        }
        vec![RoutedEvent::Event {
            event: envelope.event,
            data: envelope.data,
        }]
    }

    async fn route_message(&mut self, envelope: Envelope) -> Vec<RoutedEvent> {
        if !self.filter.allows_event(&envelope.event) {
            return Vec::new();
        }
        let message: Message = match serde_json::from_value(envelope.data) {
            Ok(message) => message,
            Err(err) => {
                debug!(event = %envelope.event, error = %err, "skipping malformed message");
                return Vec::new();
            }
        };

        if self
            .filter
            .conversation_id
            .is_some_and(|scope| scope != message.conversation_id)
        {
            return Vec::new();
        }
        if self
            .filter
            .min_created_at
            .is_some_and(|min| message.created_at < min)
        {
            return Vec::new();
        }
        if envelope.event == MESSAGE_CREATED {
            if message.id <= self.last_seen {
                debug!(message_id = message.id, last_seen = self.last_seen, "dropping already seen message");
                return Vec::new();
            }
            self.last_seen = message.id;
        }
        if self.filter.incoming_only && !message.is_incoming() {
            return Vec::new();
        }
        if message.private && !self.filter.include_private {
            return Vec::new();
        }
        if self.filter.needs_metadata() && !self.passes_metadata(message.conversation_id).await {
            return Vec::new();
        }

        let mut routed = Vec::with_capacity(2);
        if let Some(limits) = self.snapshot {
            if self.snapshotted.insert(message.conversation_id) {
                routed.push(self.snapshot_event(message.conversation_id, limits).await);
            }
        }
        routed.push(RoutedEvent::Message {
            event: envelope.event,
            message,
        });
        routed
    }

    /// Fails closed: a conversation whose metadata cannot be fetched is filtered out.
    async fn passes_metadata(&mut self, conversation_id: u64) -> bool {
        if !self.cache.is_hydrated(conversation_id) {
            let mut conversation = match self.source.fetch_conversation(conversation_id).await {
                Ok(conversation) => conversation,
                Err(err) => {
                    warn!(conversation_id, error = %err, "could not hydrate conversation metadata, dropping message");
                    return false;
                }
            };
            if !self.filter.labels.is_empty() && conversation.labels.is_empty() {
                match self.source.fetch_labels(conversation_id).await {
                    Ok(labels) => conversation.labels = labels,
                    Err(err) => {
                        warn!(conversation_id, error = %err, "could not fetch conversation labels");
                    }
                }
            }
            self.cache.hydrate(&conversation);
        }
        self.cache
            .get(conversation_id)
            .is_some_and(|meta| self.filter.matches_meta(meta))
    }

    async fn snapshot_event(&self, conversation_id: u64, limits: SnapshotLimits) -> RoutedEvent {
        match take_snapshot(&self.source, conversation_id, limits).await {
            Ok(snapshot) => RoutedEvent::Snapshot(Box::new(snapshot)),
            Err(err) => {
                warn!(conversation_id, error = %err, "snapshot failed");
                RoutedEvent::SnapshotError {
                    conversation_id,
                    error: err.to_string(),
                }
            }
        }
    }
}
