//! Per-conversation metadata used by the follow filters.
//!
//! Owned by the event-processing task alone, so plain `HashMap`, no locks.

use std::collections::{BTreeSet, HashMap};

use helpdesk_api::models::Conversation;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationMeta {
    pub id: u64,
    pub inbox_id: u64,
    pub status: String,
    pub priority: Option<String>,
    pub assignee_id: Option<u64>,
    pub contact_id: Option<u64>,
    pub labels: BTreeSet<String>,
    /// Filled from a full conversation payload, not just patched by events.
    pub hydrated: bool,
}

impl ConversationMeta {
    pub fn from_conversation(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id,
            inbox_id: conversation.inbox_id,
            status: conversation.status.clone(),
            priority: conversation.priority.clone(),
            assignee_id: conversation.assignee_id(),
            contact_id: conversation.contact_id(),
            labels: conversation.labels.iter().cloned().collect(),
            hydrated: true,
        }
    }

    /// Overwrite the fields present in a (possibly partial) conversation payload.
    fn patch(&mut self, data: &Value) {
        if let Some(inbox) = data.get("inbox_id").and_then(Value::as_u64) {
            self.inbox_id = inbox;
        }
        if let Some(status) = data.get("status").and_then(Value::as_str) {
            self.status = status.to_string();
        }
        if let Some(priority) = data.get("priority") {
            self.priority = priority.as_str().map(str::to_string);
        }
        if let Some(labels) = data.get("labels").and_then(Value::as_array) {
            self.labels = labels
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(assignee) = assignee_from(data) {
            self.assignee_id = assignee;
        }
        if let Some(contact) = data
            .pointer("/meta/sender/id")
            .or_else(|| data.get("contact_id"))
            .and_then(Value::as_u64)
        {
            self.contact_id = Some(contact);
        }
    }
}

/// `Some(None)` when the payload explicitly says "unassigned".
fn assignee_from(data: &Value) -> Option<Option<u64>> {
    if let Some(assignee) = data.get("meta").and_then(|meta| meta.get("assignee")) {
        return Some(assignee.get("id").and_then(Value::as_u64));
    }
    data.get("assignee_id").map(Value::as_u64)
}

fn conversation_id_of(data: &Value) -> Option<u64> {
    data.get("conversation_id")
        .or_else(|| data.get("id"))
        .and_then(Value::as_u64)
}

fn label_values(data: &Value) -> Vec<String> {
    if let Some(label) = data.get("label").and_then(Value::as_str) {
        return vec![label.to_string()];
    }
    data.get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct MetaCache {
    entries: HashMap<u64, ConversationMeta>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: u64) -> Option<&ConversationMeta> {
        self.entries.get(&conversation_id)
    }

    pub fn is_hydrated(&self, conversation_id: u64) -> bool {
        self.entries
            .get(&conversation_id)
            .is_some_and(|meta| meta.hydrated)
    }

    /// Store the result of a full refetch, replacing whatever events patched in.
    pub fn hydrate(&mut self, conversation: &Conversation) -> &ConversationMeta {
        let meta = ConversationMeta::from_conversation(conversation);
        debug!(conversation_id = meta.id, "conversation metadata hydrated");
        self.entries.insert(meta.id, meta);
        &self.entries[&conversation.id]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply an incremental event. Returns the conversation id it touched.
    ///
    /// A full conversation payload on `conversation.created`/`updated`
    /// inserts a hydrated entry. Every other change only patches entries
    /// already cached; unknown conversations get fetched in full the first
    /// time a filter needs them.
    pub fn apply_event(&mut self, event: &str, data: &Value) -> Option<u64> {
        match event {
            "conversation.created" | "conversation.updated" => {
                let full = data.get("inbox_id").is_some() && data.get("status").is_some();
                match serde_json::from_value::<Conversation>(data.clone()) {
                    Ok(conversation) if full => {
                        self.hydrate(&conversation);
                        Some(conversation.id)
                    }
                    _ => self.patch_existing(data),
                }
            }
            "conversation.status_changed"
            | "conversation.opened"
            | "conversation.resolved"
            | "assignee.changed"
            | "team.changed" => self.patch_existing(data),
            "label.added" | "conversation.label_added" => {
                let id = conversation_id_of(data)?;
                let meta = self.entries.get_mut(&id)?;
                meta.labels.extend(label_values(data));
                Some(id)
            }
            "label.removed" | "conversation.label_removed" => {
                let id = conversation_id_of(data)?;
                let meta = self.entries.get_mut(&id)?;
                for label in label_values(data) {
                    meta.labels.remove(&label);
                }
                Some(id)
            }
            _ => None,
        }
    }

    fn patch_existing(&mut self, data: &Value) -> Option<u64> {
        let id = data.get("id").and_then(Value::as_u64)?;
        let meta = self.entries.get_mut(&id)?;
        meta.patch(data);
        debug!(conversation_id = id, "conversation metadata patched");
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversation(id: u64) -> Conversation {
        serde_json::from_value(json!({
            "id": id, "inbox_id": 1, "status": "open", "priority": null,
            "labels": ["billing"],
            "meta": {"sender": {"id": 50}, "assignee": {"id": 7}}
        }))
        .unwrap()
    }

    #[test]
    fn hydrate_then_patch_status_and_assignee() {
        let mut cache = MetaCache::new();
        cache.hydrate(&conversation(3));
        assert!(cache.is_hydrated(3));

        cache.apply_event("conversation.status_changed", &json!({"id": 3, "status": "resolved"}));
        cache.apply_event(
            "assignee.changed",
            &json!({"id": 3, "meta": {"assignee": null}}),
        );

        let meta = cache.get(3).unwrap();
        assert_eq!(meta.status, "resolved");
        assert_eq!(meta.assignee_id, None);
        assert_eq!(meta.contact_id, Some(50));
        assert_eq!(meta.inbox_id, 1);
    }

    #[test]
    fn labels_added_and_removed() {
        let mut cache = MetaCache::new();
        cache.hydrate(&conversation(3));

        cache.apply_event("label.added", &json!({"conversation_id": 3, "label": "vip"}));
        cache.apply_event(
            "label.removed",
            &json!({"conversation_id": 3, "labels": ["billing"]}),
        );

        let labels: Vec<&str> = cache.get(3).unwrap().labels.iter().map(String::as_str).collect();
        assert_eq!(labels, vec!["vip"]);
    }

    #[test]
    fn partial_events_for_unknown_conversations_are_ignored() {
        let mut cache = MetaCache::new();
        assert_eq!(
            cache.apply_event("conversation.status_changed", &json!({"id": 9, "status": "open"})),
            None
        );
        assert_eq!(
            cache.apply_event("label.added", &json!({"conversation_id": 9, "label": "x"})),
            None
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn full_created_payload_hydrates() {
        let mut cache = MetaCache::new();
        let touched = cache.apply_event(
            "conversation.created",
            &json!({"id": 4, "inbox_id": 2, "status": "pending", "meta": {"assignee": {"id": 8}}}),
        );
        assert_eq!(touched, Some(4));
        assert!(cache.is_hydrated(4));
        assert_eq!(cache.get(4).unwrap().assignee_id, Some(8));
    }

    #[test]
    fn top_level_assignee_id_is_understood() {
        let mut cache = MetaCache::new();
        cache.hydrate(&conversation(3));
        cache.apply_event("conversation.updated", &json!({"id": 3, "assignee_id": 12}));
        assert_eq!(cache.get(3).unwrap().assignee_id, Some(12));
        cache.apply_event("conversation.updated", &json!({"id": 3, "assignee_id": null}));
        assert_eq!(cache.get(3).unwrap().assignee_id, None);
    }
}
