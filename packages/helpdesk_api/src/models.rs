//! Typed views of the REST resources the follower needs.
//!
//! Every struct keeps unrecognised fields in `extra` so records written to
//! the output stream carry the full server payload.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Direction/kind of a message. Servers send either the numeric code or the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Incoming,
    Outgoing,
    Activity,
    Template,
    Unknown(i64),
}

impl MessageType {
    pub fn code(self) -> i64 {
        match self {
            MessageType::Incoming => 0,
            MessageType::Outgoing => 1,
            MessageType::Activity => 2,
            MessageType::Template => 3,
            MessageType::Unknown(code) => code,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            0 => MessageType::Incoming,
            1 => MessageType::Outgoing,
            2 => MessageType::Activity,
            3 => MessageType::Template,
            other => MessageType::Unknown(other),
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "incoming" => MessageType::Incoming,
            "outgoing" => MessageType::Outgoing,
            "activity" => MessageType::Activity,
            "template" => MessageType::Template,
            _ => MessageType::Unknown(-1),
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Unknown(-1)
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(i64),
            Name(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Code(code) => MessageType::from_code(code),
            Raw::Name(name) => MessageType::from_name(&name),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: u64,
    #[serde(default)]
    pub conversation_id: u64,
    #[serde(default)]
    pub inbox_id: Option<u64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub private: bool,
    /// Unix seconds.
    #[serde(default, deserialize_with = "unix_seconds")]
    pub created_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn is_incoming(&self) -> bool {
        self.message_type == MessageType::Incoming
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartyRef {
    pub id: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationParties {
    #[serde(default)]
    pub sender: Option<PartyRef>,
    #[serde(default)]
    pub assignee: Option<PartyRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: u64,
    #[serde(default)]
    pub inbox_id: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub meta: ConversationParties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conversation {
    pub fn assignee_id(&self) -> Option<u64> {
        self.meta.assignee.as_ref().map(|a| a.id)
    }

    pub fn contact_id(&self) -> Option<u64> {
        self.meta.sender.as_ref().map(|s| s.id).or_else(|| {
            self.extra
                .get("contact_id")
                .and_then(Value::as_u64)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `{"payload": [...]}` list envelope used by the message and label endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Payload<T> {
    pub payload: T,
}

/// Accepts unix seconds as an integer, a float, or an RFC 3339 string.
fn unix_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(&s)
            .map(|t| t.timestamp())
            .unwrap_or_default(),
        _ => 0,
    })
}
