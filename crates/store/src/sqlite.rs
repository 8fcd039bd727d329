//! SQLite conversation store.
//!
//! Uses a single SQLite database file with three tables:
//! - `conversations`: one row per conversation, metadata as JSON text
//! - `messages`: append-only, `AUTOINCREMENT` ids
//! - `context_injections`: `seq` records insertion order for priority ties
//!
//! Timestamps are stored as fixed-width RFC 3339 text so that `ORDER BY`
//! on the column is chronological.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::error::StoreError;
use kiln_core::message::{format_timestamp, new_id, now};
use kiln_core::{
    ContextInjection, Conversation, ConversationStore, ConversationSummary, InjectionKind,
    Metadata, NewInjection, NewMessage, Role, StoreStats, StoredMessage,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// A SQLite-backed [`ConversationStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    ///
    /// Parent directories, tables, and indexes are created automatically.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!(path = %path.display(), "SQLite conversation store initialized");
        Ok(store)
    }

    /// An ephemeral in-process database.
    ///
    /// Restricted to one connection: every `:memory:` connection is its own
    /// database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        Self::from_pool(pool).await
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            (
                "conversations table",
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id          TEXT PRIMARY KEY,
                    name        TEXT NOT NULL,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL,
                    metadata    TEXT NOT NULL DEFAULT '{}'
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id),
                    role            TEXT NOT NULL,
                    content         TEXT NOT NULL,
                    timestamp       TEXT NOT NULL,
                    token_count     INTEGER NOT NULL DEFAULT 0
                )
                "#,
            ),
            (
                "context_injections table",
                r#"
                CREATE TABLE IF NOT EXISTS context_injections (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    id              TEXT UNIQUE NOT NULL,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id),
                    type            TEXT NOT NULL,
                    content         TEXT NOT NULL,
                    priority        INTEGER NOT NULL DEFAULT 0,
                    active          INTEGER NOT NULL DEFAULT 1,
                    created_at      TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
                 ON messages(conversation_id, timestamp, id)",
            ),
            (
                "injections index",
                "CREATE INDEX IF NOT EXISTS idx_injections_conversation \
                 ON context_injections(conversation_id, active, priority DESC, seq)",
            ),
            (
                "updated_at index",
                "CREATE INDEX IF NOT EXISTS idx_conversations_updated \
                 ON conversations(updated_at DESC)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, StoreError> {
        let metadata: String = row.try_get("metadata").map_err(query_err)?;
        let metadata: Metadata = serde_json::from_str(&metadata)
            .map_err(|e| StoreError::QueryFailed(format!("Corrupt metadata: {e}")))?;

        Ok(Conversation {
            id: row.try_get("id").map_err(query_err)?,
            name: row.try_get("name").map_err(query_err)?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(query_err)?)?,
            updated_at: parse_ts(&row.try_get::<String, _>("updated_at").map_err(query_err)?)?,
            metadata,
        })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, StoreError> {
        let role: String = row.try_get("role").map_err(query_err)?;
        let token_count: i64 = row.try_get("token_count").map_err(query_err)?;

        Ok(StoredMessage {
            id: row.try_get("id").map_err(query_err)?,
            conversation_id: row.try_get("conversation_id").map_err(query_err)?,
            role: Role::parse(&role)
                .ok_or_else(|| StoreError::QueryFailed(format!("Unknown role: {role}")))?,
            content: row.try_get("content").map_err(query_err)?,
            timestamp: parse_ts(&row.try_get::<String, _>("timestamp").map_err(query_err)?)?,
            token_count: u32::try_from(token_count).unwrap_or(0),
        })
    }

    fn row_to_injection(row: &sqlx::sqlite::SqliteRow) -> Result<ContextInjection, StoreError> {
        let kind: String = row.try_get("type").map_err(query_err)?;

        Ok(ContextInjection {
            id: row.try_get("id").map_err(query_err)?,
            conversation_id: row.try_get("conversation_id").map_err(query_err)?,
            kind: InjectionKind::parse(&kind)
                .ok_or_else(|| StoreError::QueryFailed(format!("Unknown injection type: {kind}")))?,
            content: row.try_get("content").map_err(query_err)?,
            priority: row.try_get("priority").map_err(query_err)?,
            active: row.try_get("active").map_err(query_err)?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(query_err)?)?,
        })
    }

    async fn conversation_exists(
        conn: &mut sqlx::SqliteConnection,
        id: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(storage_err)?;
        Ok(row.is_some())
    }
}

fn storage_err(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::QueryFailed(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("Bad timestamp {s:?}: {e}")))
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
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
        let metadata_json = serde_json::to_string(&conversation.metadata)
            .map_err(|e| StoreError::Storage(format!("Metadata not serializable: {e}")))?;
        let ts = format_timestamp(&now);

        sqlx::query(
            "INSERT INTO conversations (id, name, created_at, updated_at, metadata) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.name)
        .bind(&ts)
        .bind(&ts)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(id = %conversation.id, name, "Created conversation");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, created_at, updated_at, metadata FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // Write first so the transaction takes the write lock up front: a
        // read-then-write transaction cannot upgrade once another connection
        // has committed (SQLITE_BUSY_SNAPSHOT).
        let found = sqlx::query("UPDATE conversations SET updated_at = updated_at WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if found.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }

        // Stamped under the write lock, so timestamps follow id order.
        let now = now();
        let ts = format_timestamp(&now);

        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, timestamp, token_count) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&ts)
        .bind(i64::from(message.token_count))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&ts)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        Ok(StoredMessage {
            id: result.last_insert_rowid(),
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content,
            timestamp: now,
            token_count: message.token_count,
        })
    }

    async fn get_history(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = match limit {
            Some(limit) => {
                // Take the newest `limit`, then re-sort ascending.
                sqlx::query(
                    "SELECT * FROM ( \
                         SELECT id, conversation_id, role, content, timestamp, token_count \
                         FROM messages WHERE conversation_id = ? \
                         ORDER BY timestamp DESC, id DESC LIMIT ? \
                     ) ORDER BY timestamp ASC, id ASC",
                )
                .bind(conversation_id)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, conversation_id, role, content, timestamp, token_count \
                     FROM messages WHERE conversation_id = ? \
                     ORDER BY timestamp ASC, id ASC",
                )
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn message_count(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn add_injection(
        &self,
        conversation_id: &str,
        injection: NewInjection,
    ) -> Result<ContextInjection, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;

        if !Self::conversation_exists(&mut conn, conversation_id).await? {
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

        sqlx::query(
            "INSERT INTO context_injections \
             (id, conversation_id, type, content, priority, active, created_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&created.id)
        .bind(conversation_id)
        .bind(created.kind.as_str())
        .bind(&created.content)
        .bind(created.priority)
        .bind(format_timestamp(&created.created_at))
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;

        debug!(
            conversation_id,
            kind = created.kind.as_str(),
            priority = created.priority,
            "Added context injection"
        );
        Ok(created)
    }

    async fn get_active_injections(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ContextInjection>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, type, content, priority, active, created_at \
             FROM context_injections \
             WHERE conversation_id = ? AND active = 1 \
             ORDER BY priority DESC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_injection).collect()
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.created_at, c.updated_at, c.metadata, \
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) \
                        AS message_count \
             FROM conversations c \
             ORDER BY c.updated_at DESC, c.created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                let count: i64 = row.try_get("message_count").map_err(query_err)?;
                Ok(ConversationSummary {
                    conversation: Self::row_to_conversation(row)?,
                    message_count: u64::try_from(count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            "SELECT \
                (SELECT COUNT(*) FROM conversations) AS conversations, \
                (SELECT COUNT(*) FROM messages) AS messages, \
                (SELECT COUNT(*) FROM context_injections WHERE active = 1) AS injections",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let count = |col: &str| -> Result<u64, StoreError> {
            let n: i64 = row.try_get(col).map_err(query_err)?;
            Ok(u64::try_from(n).unwrap_or(0))
        };

        Ok(StoreStats {
            conversation_count: count("conversations")?,
            message_count: count("messages")?,
            active_injection_count: count("injections")?,
        })
    }
}
