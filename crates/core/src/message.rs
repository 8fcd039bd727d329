//! Conversation, message, and context-injection domain types.
//!
//! These are the value objects that flow through the whole pipeline:
//! caller sends messages → assembler merges stored context → gate generates →
//! the exchange is persisted back into the store.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque key-value metadata attached to a conversation.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Generate a fresh opaque identifier for conversations and injections.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time at the precision timestamps are stored with (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 rendering (microseconds, `Z` suffix).
///
/// Every timestamp has the same width, so lexical order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_role() -> Role {
    Role::User
}

/// A role/content pair as sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Defaults to `user` when omitted on the wire.
    #[serde(default = "default_role")]
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A named, persistent thread of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every message append.
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A conversation plus its message count, as returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub message_count: u64,
}

/// A message as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned, monotonic.
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Advisory only.
    pub token_count: u32,
}

impl StoredMessage {
    /// Drop the storage-only fields.
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Input to [`ConversationStore::append_message`](crate::store::ConversationStore::append_message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default = "default_role")]
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub token_count: u32,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            token_count: 0,
        }
    }

    pub fn with_token_count(mut self, token_count: u32) -> Self {
        self.token_count = token_count;
        self
    }
}

impl From<ChatMessage> for NewMessage {
    fn from(m: ChatMessage) -> Self {
        Self::new(m.role, m.content)
    }
}

/// Kind of operator-supplied context.
///
/// Only `System` injections are merged into prompts; the other kinds are
/// stored and listed but reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionKind {
    System,
    Background,
    Instruction,
    Knowledge,
}

impl InjectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Background => "background",
            Self::Instruction => "instruction",
            Self::Knowledge => "knowledge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "background" => Some(Self::Background),
            "instruction" => Some(Self::Instruction),
            "knowledge" => Some(Self::Knowledge),
            _ => None,
        }
    }
}

/// A prioritized piece of context attached to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInjection {
    pub id: String,
    pub conversation_id: String,
    #[serde(rename = "type")]
    pub kind: InjectionKind,
    pub content: String,
    /// Higher is more important.
    pub priority: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input to [`ConversationStore::add_injection`](crate::store::ConversationStore::add_injection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInjection {
    #[serde(rename = "type")]
    pub kind: InjectionKind,
    pub content: String,
    #[serde(default)]
    pub priority: i32,
}

impl NewInjection {
    pub fn new(kind: InjectionKind, content: impl Into<String>, priority: i32) -> Self {
        Self {
            kind,
            content: content.into(),
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        assert_eq!(Role::parse("system"), Some(Role::System));
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn chat_message_role_defaults_to_user() {
        let msg: ChatMessage = serde_json::from_str(r#"{"content": "hi"}"#).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hi");
    }

    #[test]
    fn injection_kind_uses_type_key() {
        let inj: NewInjection =
            serde_json::from_str(r#"{"type": "knowledge", "content": "fact"}"#).unwrap();
        assert_eq!(inj.kind, InjectionKind::Knowledge);
        assert_eq!(inj.priority, 0);
        let back = serde_json::to_value(&inj).unwrap();
        assert_eq!(back["type"], "knowledge");
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let b = a + chrono::Duration::microseconds(1_500_000);
        let (fa, fb) = (format_timestamp(&a), format_timestamp(&b));
        assert_eq!(fa.len(), fb.len());
        assert_eq!(fa, "2024-01-01T00:00:00.000000Z");
        assert!(fa < fb);
    }

    #[test]
    fn now_survives_formatting() {
        let t = now();
        let parsed = DateTime::parse_from_rfc3339(&format_timestamp(&t)).unwrap();
        assert_eq!(parsed.with_timezone(&Utc), t);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn summary_flattens_conversation() {
        let now = Utc::now();
        let summary = ConversationSummary {
            conversation: Conversation {
                id: "c1".into(),
                name: "chat".into(),
                created_at: now,
                updated_at: now,
                metadata: Metadata::new(),
            },
            message_count: 3,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["message_count"], 3);
    }
}
