//! SQLite-backed message store.
//!
//! Conversations exclusively own their messages; sequences are 1-based and
//! dense per conversation, assigned by `COUNT(*)+1` inside a transaction so
//! concurrent writers cannot produce gaps or duplicates. All driver calls
//! run on the blocking pool; the connection is shared behind a mutex.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use parley_domain::error::{Error, Result};
use parley_domain::message::{
    decode_parts, encode_parts, role_type_allowed, Conversation, MessageType, Part, Role,
    StoredMessage,
};

use crate::sanitize::sanitize_history;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    conversation_id TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL DEFAULT '',
    title           TEXT NOT NULL DEFAULT '',
    message_count   INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id) ON DELETE CASCADE,
    sequence        INTEGER NOT NULL,
    role            TEXT NOT NULL,
    type            TEXT NOT NULL,
    parts_json      TEXT NOT NULL,
    function_id     TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE(conversation_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, sequence);
"#;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Message store over a single SQLite connection.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn connect(path: PathBuf) -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> rusqlite::Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("message store mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Persist one message, creating the conversation lazily on first use.
    ///
    /// The sequence is `COUNT(*)+1` computed inside the same transaction
    /// as the insert, which keeps sequences dense under concurrency. The
    /// advisory `message_count` is bumped and `updated_at` touched.
    pub async fn save_message(
        &self,
        conversation_id: &str,
        user_id: Option<&str>,
        role: Role,
        message_type: MessageType,
        parts: &[Part],
        function_id: Option<String>,
    ) -> Result<StoredMessage> {
        if !role_type_allowed(role, message_type) {
            return Err(Error::Validation(format!(
                "role {} cannot carry type {}",
                role.as_str(),
                message_type.as_str()
            )));
        }

        let parts_json = encode_parts(parts)?;
        let conversation_id = conversation_id.to_owned();
        let user_id = user_id.unwrap_or_default().to_owned();
        let parts_vec = parts.to_vec();
        let now = Utc::now();

        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO conversations
                     (conversation_id, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![conversation_id, user_id, now],
            )?;

            let sequence: i64 = tx.query_row(
                "SELECT COUNT(*) + 1 FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages
                     (conversation_id, sequence, role, type, parts_json, function_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    conversation_id,
                    sequence,
                    role.as_str(),
                    message_type.as_str(),
                    parts_json,
                    function_id,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE conversations
                 SET message_count = message_count + 1, updated_at = ?2
                 WHERE conversation_id = ?1",
                params![conversation_id, now],
            )?;

            tx.commit()?;

            Ok(StoredMessage {
                id,
                conversation_id,
                sequence,
                role,
                message_type,
                parts: parts_vec,
                function_id,
                created_at: now,
            })
        })
        .await
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Fetch the last `limit` messages in ascending sequence (all when
    /// `limit == 0`), sanitized for model turn-structure rules.
    ///
    /// When limiting, an extra `max(limit, 10)` messages are fetched as a
    /// sanitization buffer: truncation can orphan tool turns, and the
    /// buffer gives the sanitizer earlier context to pair them against.
    /// The slice is sanitized, truncated to `limit`, then sanitized again
    /// because the truncation itself can re-introduce orphans.
    pub async fn fetch_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let fetch = if limit == 0 {
            0
        } else {
            limit + limit.max(10)
        };

        let conversation_id_owned = conversation_id.to_owned();
        let mut messages = self
            .run_blocking(move |conn| {
                let sql = if fetch == 0 {
                    "SELECT id, conversation_id, sequence, role, type, parts_json, function_id, created_at
                     FROM messages WHERE conversation_id = ?1 ORDER BY sequence ASC"
                } else {
                    "SELECT id, conversation_id, sequence, role, type, parts_json, function_id, created_at
                     FROM (SELECT * FROM messages WHERE conversation_id = ?1
                           ORDER BY sequence DESC LIMIT ?2)
                     ORDER BY sequence ASC"
                };

                let mut stmt = conn.prepare(sql)?;
                let map_row = |row: &rusqlite::Row<'_>| row_to_message(row);
                let rows = if fetch == 0 {
                    stmt.query_map(params![conversation_id_owned], map_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                } else {
                    stmt.query_map(params![conversation_id_owned, fetch as i64], map_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };
                Ok(rows)
            })
            .await?;

        messages = sanitize_history(messages);
        if limit > 0 && messages.len() > limit {
            messages = messages.split_off(messages.len() - limit);
            messages = sanitize_history(messages);
        }
        Ok(messages)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conversation_id = conversation_id.to_owned();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT conversation_id, user_id, title, message_count, created_at, updated_at
                 FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                row_to_conversation,
            )
            .optional()
        })
        .await
    }

    /// All conversations, most recently updated first. The stored
    /// `message_count` is returned as-is here.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.run_blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, title, message_count, created_at, updated_at
                 FROM conversations ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_conversation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Conversations for one user with the message count computed by
    /// subquery. The stored count can drift under concurrent writers, so
    /// this projection never trusts it.
    pub async fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let user_id = user_id.to_owned();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.conversation_id, c.user_id, c.title,
                        (SELECT COUNT(*) FROM messages m
                         WHERE m.conversation_id = c.conversation_id) AS message_count,
                        c.created_at, c.updated_at
                 FROM conversations c
                 WHERE c.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], row_to_conversation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub async fn create_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation> {
        let conversation_id = conversation_id.to_owned();
        let user_id = user_id.to_owned();
        let now = Utc::now();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversations
                     (conversation_id, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![conversation_id, user_id, now],
            )?;
            conn.query_row(
                "SELECT conversation_id, user_id, title, message_count, created_at, updated_at
                 FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                row_to_conversation,
            )
        })
        .await
    }

    /// Delete a conversation and (via cascade) all of its messages.
    /// Returns `true` when a row was removed.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let conversation_id = conversation_id.to_owned();
        self.run_blocking(move |conn| {
            let affected = conn.execute(
                "DELETE FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            Ok(affected > 0)
        })
        .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_str: String = row.get(3)?;
    let type_str: String = row.get(4)?;
    let parts_json: String = row.get(5)?;

    let role = Role::parse(&role_str)
        .ok_or_else(|| bad_column(3, format!("unknown role {role_str:?}")))?;
    let message_type = MessageType::parse(&type_str)
        .ok_or_else(|| bad_column(4, format!("unknown message type {type_str:?}")))?;

    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence: row.get(2)?,
        role,
        message_type,
        parts: decode_parts(&parts_json),
        function_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        message_count: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn bad_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> MessageStore {
        MessageStore::connect_in_memory().await.unwrap()
    }

    async fn save_text(
        store: &MessageStore,
        conversation: &str,
        role: Role,
        message_type: MessageType,
        text: &str,
    ) -> StoredMessage {
        store
            .save_message(
                conversation,
                Some("u1"),
                role,
                message_type,
                &[Part::text(text)],
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sequences_are_dense_and_one_based() {
        let store = store().await;
        for i in 0..5 {
            let msg = save_text(
                &store,
                "c1",
                if i % 2 == 0 { Role::User } else { Role::Model },
                if i % 2 == 0 {
                    MessageType::UserMessage
                } else {
                    MessageType::ModelMessage
                },
                &format!("m{i}"),
            )
            .await;
            assert_eq!(msg.sequence, i + 1);
        }

        let history = store.fetch_history("c1", 0).await.unwrap();
        let sequences: Vec<i64> = history.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn conversation_created_lazily_with_user() {
        let store = store().await;
        save_text(&store, "c1", Role::User, MessageType::UserMessage, "hi").await;

        let conv = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.user_id, "u1");
        assert_eq!(conv.message_count, 1);
    }

    #[tokio::test]
    async fn invalid_role_type_pair_rejected() {
        let store = store().await;
        let err = store
            .save_message(
                "c1",
                None,
                Role::User,
                MessageType::ModelMessage,
                &[Part::text("x")],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn degenerate_parts_stored_as_empty_object() {
        let store = store().await;
        store
            .save_message("c1", None, Role::User, MessageType::UserMessage, &[], None)
            .await
            .unwrap();

        // Read the raw payload back out of the driver.
        let raw: String = {
            let conn = store.conn.lock().unwrap();
            conn.query_row("SELECT parts_json FROM messages", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(raw, "{}");
    }

    #[tokio::test]
    async fn fetch_history_limit_returns_ascending_tail() {
        let store = store().await;
        for i in 0..6 {
            save_text(
                &store,
                "c1",
                if i % 2 == 0 { Role::User } else { Role::Model },
                if i % 2 == 0 {
                    MessageType::UserMessage
                } else {
                    MessageType::ModelMessage
                },
                &format!("m{i}"),
            )
            .await;
        }

        let history = store.fetch_history("c1", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message_type, MessageType::UserMessage);
        assert_eq!(
            parley_domain::message::collect_text(&history[0].parts),
            "m4"
        );
        assert_eq!(history[1].message_type, MessageType::ModelMessage);
    }

    #[tokio::test]
    async fn truncated_history_never_leads_with_orphan_response() {
        // Stored: user, model(call f1), user(response f1), user, model(call f2)
        let store = store().await;
        save_text(&store, "c1", Role::User, MessageType::UserMessage, "q1").await;
        store
            .save_message(
                "c1",
                None,
                Role::Model,
                MessageType::FunctionCall,
                &[Part::function_call(Some("f1".into()), "Search", json!({"q": "x"}))],
                Some("f1".into()),
            )
            .await
            .unwrap();
        store
            .save_message(
                "c1",
                None,
                Role::User,
                MessageType::FunctionResponse,
                &[Part::function_response(Some("f1".into()), "Search", json!({"r": 1}))],
                Some("f1".into()),
            )
            .await
            .unwrap();
        save_text(&store, "c1", Role::User, MessageType::UserMessage, "q2").await;
        store
            .save_message(
                "c1",
                None,
                Role::Model,
                MessageType::FunctionCall,
                &[Part::function_call(Some("f2".into()), "Search", json!({"q": "y"}))],
                Some("f2".into()),
            )
            .await
            .unwrap();

        let history = store.fetch_history("c1", 2).await.unwrap();
        if let Some(first) = history.first() {
            assert_eq!(first.message_type, MessageType::UserMessage);
        }
        for msg in &history {
            assert_ne!(
                msg.message_type,
                MessageType::FunctionResponse,
                "orphan response must not survive truncation"
            );
        }
    }

    #[tokio::test]
    async fn computed_count_ignores_stale_counter() {
        let store = store().await;
        save_text(&store, "c1", Role::User, MessageType::UserMessage, "hi").await;
        save_text(&store, "c1", Role::Model, MessageType::ModelMessage, "yo").await;

        // Corrupt the advisory counter.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE conversations SET message_count = 99", [])
                .unwrap();
        }

        let listed = store.list_conversations_for_user("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message_count, 2, "projection must compute the count");
    }

    #[tokio::test]
    async fn list_for_user_orders_by_updated_at_desc() {
        let store = store().await;
        save_text(&store, "old", Role::User, MessageType::UserMessage, "a").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        save_text(&store, "new", Role::User, MessageType::UserMessage, "b").await;

        let listed = store.list_conversations_for_user("u1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|c| c.conversation_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn delete_cascades_to_messages() {
        let store = store().await;
        save_text(&store, "c1", Role::User, MessageType::UserMessage, "hi").await;
        assert!(store.delete_conversation("c1").await.unwrap());
        assert!(store.get_conversation("c1").await.unwrap().is_none());
        assert!(store.fetch_history("c1", 0).await.unwrap().is_empty());
        assert!(!store.delete_conversation("c1").await.unwrap());
    }

    #[tokio::test]
    async fn create_conversation_is_idempotent() {
        let store = store().await;
        let first = store.create_conversation("c1", "u1").await.unwrap();
        let second = store.create_conversation("c1", "other").await.unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
        // First writer wins; the row is not re-created.
        assert_eq!(second.user_id, "u1");
    }
}
