//! Conversation identity, storage keys and the three data bags

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

use crate::engine::PersistedStack;

/* ===================== Identity ===================== */

/// Who a turn belongs to, already normalized by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationIdentity {
    pub channel_id: String,
    pub conversation_id: String,
    pub user_id: String,
}

impl ConversationIdentity {
    pub fn new(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Components are joined with `:` after escaping `%` and `:` in each, so
    /// distinct identities never share a key
    pub fn key(&self, partition: Partition) -> StateKey {
        let channel = escape_component(&self.channel_id);
        let key = match partition {
            Partition::User => format!("{}:{}", channel, escape_component(&self.user_id)),
            Partition::Conversation => {
                format!("{}:{}", channel, escape_component(&self.conversation_id))
            }
            Partition::PrivateConversation => format!(
                "{}:{}:{}",
                channel,
                escape_component(&self.conversation_id),
                escape_component(&self.user_id)
            ),
        };
        StateKey { partition, key }
    }

    /// Keys of all three partitions, in `Partition::ALL` order
    pub fn keys(&self) -> [StateKey; 3] {
        Partition::ALL.map(|p| self.key(p))
    }
}

impl fmt::Display for ConversationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.channel_id, self.conversation_id, self.user_id
        )
    }
}

/// Percent-escape the key separator; `%` goes first so escapes stay unambiguous
fn escape_component(component: &str) -> String {
    component.replace('%', "%25").replace(':', "%3A")
}

/// Lifetime of a piece of persisted data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Follows the user across conversations
    User,
    /// Shared by everyone in the conversation
    Conversation,
    /// One user within one conversation; also holds the dialog stack
    PrivateConversation,
}

impl Partition {
    pub const ALL: [Partition; 3] = [
        Partition::User,
        Partition::Conversation,
        Partition::PrivateConversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::User => "user",
            Partition::Conversation => "conversation",
            Partition::PrivateConversation => "private",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Partition::User),
            "conversation" => Some(Partition::Conversation),
            "private" => Some(Partition::PrivateConversation),
            _ => None,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage address of one partition record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub partition: Partition,
    pub key: String,
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.key)
    }
}

/* ===================== Bag ===================== */

/// Free-form key/value data persisted across turns
///
/// Any dialog at any depth may read and write a bag. The dirty flag lets the
/// dispatcher skip writing partitions nobody touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bag {
    values: Map<String, JsonValue>,
    #[serde(skip)]
    dirty: bool,
}

impl Bag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.values.clone())
    }

    /// Typed read. `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    pub fn get_value(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.set_value(key, value);
        Ok(())
    }

    pub fn set_value(&mut self, key: &str, value: JsonValue) {
        self.values.insert(key.to_string(), value);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.values.is_empty() {
            self.values.clear();
            self.dirty = true;
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the bag was modified since it was loaded
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/* ===================== Private Record ===================== */

/// What the private-conversation partition stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateRecord {
    /// `None` when no conversation is in progress
    #[serde(default)]
    pub stack: Option<PersistedStack>,
    #[serde(default)]
    pub data: Bag,
    pub updated_at: DateTime<Utc>,
    /// `DialogRegistry::fingerprint` of the deployment that wrote `stack`
    #[serde(default)]
    pub registry_fingerprint: Option<String>,
}

impl PrivateRecord {
    pub fn new(stack: Option<PersistedStack>, data: Bag, registry_fingerprint: String) -> Self {
        Self {
            stack,
            data,
            updated_at: Utc::now(),
            registry_fingerprint: Some(registry_fingerprint),
        }
    }
}
