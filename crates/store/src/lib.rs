//! Conversation store implementations for kiln.

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;

use kiln_config::{StoreBackend, StoreConfig};
use kiln_core::{ConversationStore, StoreError};
use std::sync::Arc;

/// Open the backend selected by configuration.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, StoreError> {
    match config.backend {
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path).await?)),
        StoreBackend::Memory => {
            tracing::info!("Using in-memory conversation store; nothing will be persisted");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Behavior every backend must share, run from each backend's tests.
#[cfg(test)]
pub(crate) mod contract {
    use kiln_core::{
        ConversationStore, InjectionKind, Metadata, NewInjection, NewMessage, Role, StoreError,
    };
    use std::sync::Arc;
    use std::time::Duration;

    pub async fn create_and_get_conversation(store: &dyn ConversationStore) {
        let a = store.create_conversation("first", Metadata::new()).await.unwrap();
        let b = store.create_conversation("first", Metadata::new()).await.unwrap();
        assert_ne!(a.id, b.id, "ids must be unique even for equal names");
        assert_eq!(a.created_at, a.updated_at);

        let fetched = store.get_conversation(&a.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "first");
        assert!(store.get_conversation("missing").await.unwrap().is_none());
    }

    pub async fn append_to_unknown_conversation_fails(store: &dyn ConversationStore) {
        let err = store
            .append_message("nope", NewMessage::new(Role::User, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(ref id) if id == "nope"));

        let err = store
            .add_injection("nope", NewInjection::new(InjectionKind::System, "x", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));

        assert_eq!(store.stats().await.unwrap().message_count, 0);
    }

    pub async fn history_tail_is_ascending(store: &dyn ConversationStore) {
        let conv = store.create_conversation("h", Metadata::new()).await.unwrap();
        for i in 1..=5 {
            let role = if i % 2 == 1 { Role::User } else { Role::Assistant };
            store
                .append_message(&conv.id, NewMessage::new(role, format!("M{i}")).with_token_count(i))
                .await
                .unwrap();
        }

        let all = store.get_history(&conv.id, None).await.unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["M1", "M2", "M3", "M4", "M5"]);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(all[2].token_count, 3);

        let tail = store.get_history(&conv.id, Some(2)).await.unwrap();
        let contents: Vec<_> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["M4", "M5"]);

        assert!(store.get_history(&conv.id, Some(0)).await.unwrap().is_empty());
        assert_eq!(store.message_count(&conv.id).await.unwrap(), 5);
        assert_eq!(store.get_history(&conv.id, Some(50)).await.unwrap().len(), 5);
    }

    pub async fn injections_ordered_by_priority_then_insertion(store: &dyn ConversationStore) {
        let conv = store.create_conversation("i", Metadata::new()).await.unwrap();
        for (content, priority) in [("p5", 5), ("p10a", 10), ("p10b", 10), ("p1", 1)] {
            store
                .add_injection(&conv.id, NewInjection::new(InjectionKind::System, content, priority))
                .await
                .unwrap();
        }

        let active = store.get_active_injections(&conv.id).await.unwrap();
        let contents: Vec<_> = active.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, ["p10a", "p10b", "p5", "p1"]);
        assert!(active.iter().all(|i| i.active));
    }

    pub async fn append_bumps_updated_at_and_listing_order(store: &dyn ConversationStore) {
        let older = store.create_conversation("older", Metadata::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = store.create_conversation("newer", Metadata::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed[0].conversation.id, newer.id);

        store
            .append_message(&older.id, NewMessage::new(Role::User, "bump"))
            .await
            .unwrap();

        let bumped = store.get_conversation(&older.id).await.unwrap().unwrap();
        assert!(bumped.updated_at > older.updated_at);
        assert_eq!(bumped.created_at, older.created_at);

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed[0].conversation.id, older.id);
        assert_eq!(listed[0].message_count, 1);
        assert_eq!(listed[1].message_count, 0);
    }

    pub async fn stats_count_everything(store: &dyn ConversationStore) {
        let conv = store.create_conversation("s", Metadata::new()).await.unwrap();
        store.create_conversation("t", Metadata::new()).await.unwrap();
        store
            .append_message(&conv.id, NewMessage::new(Role::User, "a"))
            .await
            .unwrap();
        store
            .append_message(&conv.id, NewMessage::new(Role::Assistant, "b"))
            .await
            .unwrap();
        store
            .add_injection(&conv.id, NewInjection::new(InjectionKind::Knowledge, "k", 0))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.conversation_count, 2);
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.active_injection_count, 1);
    }

    pub async fn concurrent_appends_all_land(store: Arc<dyn ConversationStore>) {
        const WRITERS: usize = 64;
        let conv = store.create_conversation("busy", Metadata::new()).await.unwrap();

        let tasks: Vec<_> = (0..WRITERS)
            .map(|i| {
                let store = store.clone();
                let id = conv.id.clone();
                tokio::spawn(async move {
                    store
                        .append_message(&id, NewMessage::new(Role::User, format!("m{i}")))
                        .await?;
                    store.get_history(&id, Some(3)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let history = store.get_history(&conv.id, None).await.unwrap();
        assert_eq!(history.len(), WRITERS);
        assert!(history.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(store.stats().await.unwrap().message_count, WRITERS as u64);
    }

    pub async fn unknown_conversation_reads_are_empty(store: &dyn ConversationStore) {
        assert!(store.get_history("ghost", None).await.unwrap().is_empty());
        assert!(store.get_active_injections("ghost").await.unwrap().is_empty());
        assert_eq!(store.message_count("ghost").await.unwrap(), 0);
    }
}
