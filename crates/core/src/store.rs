//! Conversation store trait: persistent conversations, messages, and
//! prioritized context injections.
//!
//! Writes are strict: appending to a conversation that does not exist fails
//! with [`StoreError::ConversationNotFound`]. Reads of an unknown conversation
//! return an empty sequence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::{
    ContextInjection, Conversation, ConversationSummary, Metadata, NewInjection, NewMessage,
    StoredMessage,
};

/// Aggregate counts across the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub conversation_count: u64,
    pub message_count: u64,
    pub active_injection_count: u64,
}

/// A storage backend for conversations.
///
/// Each operation is a self-contained unit; implementations must be safe to
/// call concurrently.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Create a conversation with a fresh unique id.
    async fn create_conversation(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Append a message and bump the conversation's `updated_at`.
    async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError>;

    /// Messages in ascending time order. With a limit, the most recent
    /// `limit` messages are returned, still ascending.
    async fn get_history(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Number of messages in a conversation; 0 for an unknown id.
    async fn message_count(&self, conversation_id: &str) -> Result<u64, StoreError>;

    /// Always inserts a new active injection.
    async fn add_injection(
        &self,
        conversation_id: &str,
        injection: NewInjection,
    ) -> Result<ContextInjection, StoreError>;

    /// Active injections by priority descending, insertion order for ties.
    async fn get_active_injections(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ContextInjection>, StoreError>;

    /// Conversations by `updated_at` descending.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
