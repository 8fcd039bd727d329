//! In-memory store: for tests and ephemeral runs.

use async_trait::async_trait;
use kiln_core::error::StoreError;
use kiln_core::message::{new_id, now};
use kiln_core::{
    ContextInjection, Conversation, ConversationStore, ConversationSummary, Metadata,
    NewInjection, NewMessage, StoreStats, StoredMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    /// Append order doubles as id order.
    messages: Vec<StoredMessage>,
    /// Append order doubles as insertion sequence.
    injections: Vec<ContextInjection>,
    next_message_id: i64,
}

/// A [`ConversationStore`] that lives for the life of the process.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_conversation(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<Conversation, StoreError> {
        let now = now();
        let conversation = Conversation {
            id: new_id(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            metadata,
        };
        self.inner
            .write()
            .await
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.read().await.conversations.get(id).cloned())
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.write().await;
        let now = now();

        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        conversation.updated_at = now;

        inner.next_message_id += 1;
        let stored = StoredMessage {
            id: inner.next_message_id,
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content,
            timestamp: now,
            token_count: message.token_count,
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn message_count(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count() as u64)
    }

    async fn get_history(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.read().await;
        let mut history: Vec<StoredMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        if let Some(limit) = limit {
            let skip = history.len().saturating_sub(limit);
            history.drain(..skip);
        }
        Ok(history)
    }

    async fn add_injection(
        &self,
        conversation_id: &str,
        injection: NewInjection,
    ) -> Result<ContextInjection, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.conversations.contains_key(conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }

        let created = ContextInjection {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            kind: injection.kind,
            content: injection.content,
            priority: injection.priority,
            active: true,
            created_at: now(),
        };
        inner.injections.push(created.clone());
        Ok(created)
    }

    async fn get_active_injections(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ContextInjection>, StoreError> {
        let inner = self.inner.read().await;
        let mut active: Vec<ContextInjection> = inner
            .injections
            .iter()
            .filter(|i| i.conversation_id == conversation_id && i.active)
            .cloned()
            .collect();
        // Stable sort keeps insertion order within a priority.
        active.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(active)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .map(|c| ConversationSummary {
                conversation: c.clone(),
                message_count: inner
                    .messages
                    .iter()
                    .filter(|m| m.conversation_id == c.id)
                    .count() as u64,
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.conversation
                .updated_at
                .cmp(&a.conversation.updated_at)
                .then(b.conversation.created_at.cmp(&a.conversation.created_at))
        });
        Ok(summaries)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.inner.read().await;
        Ok(StoreStats {
            conversation_count: inner.conversations.len() as u64,
            message_count: inner.messages.len() as u64,
            active_injection_count: inner.injections.iter().filter(|i| i.active).count() as u64,
        })
    }
}
