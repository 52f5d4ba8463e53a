//! SQLite-backed store.
//!
//! Records are stored as JSON bodies next to the columns the queries filter
//! and order on. The connection lives behind a mutex and every call hops to
//! the blocking pool, keeping the async executor free of file I/O.

use super::{MessageRepository, Page, PersistenceError, ThreadRepository};
use crate::model::{Message, Thread};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                 id         TEXT PRIMARY KEY,
                 chat_id    TEXT NOT NULL,
                 thread_id  TEXT,
                 created_at TEXT NOT NULL,
                 body       TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_messages_chat
                 ON messages(chat_id, created_at);
             CREATE INDEX IF NOT EXISTS idx_messages_thread
                 ON messages(thread_id, created_at);
             CREATE TABLE IF NOT EXISTS threads (
                 id                TEXT PRIMARY KEY,
                 parent_message_id TEXT NOT NULL UNIQUE,
                 chat_id           TEXT NOT NULL,
                 body              TEXT NOT NULL
             );",
        )
    }
}

fn backend_err(error: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Unavailable {
        reason: error.to_string(),
    }
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn decode_message(body: &str) -> Result<Message, PersistenceError> {
    serde_json::from_str(body).map_err(backend_err)
}

async fn on_blocking_pool<T, F>(task: F) -> Result<T, PersistenceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(backend_err)?
}

#[async_trait]
impl MessageRepository for SqliteStore {
    async fn create_message(&self, message: &Message) -> Result<Message, PersistenceError> {
        let conn = self.conn.clone();
        let message = message.clone();
        on_blocking_pool(move || {
            let body = serde_json::to_string(&message).map_err(backend_err)?;
            let result = conn.lock().execute(
                "INSERT INTO messages (id, chat_id, thread_id, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.id,
                    message.chat_id,
                    message.thread_id,
                    message.created_at.to_rfc3339(),
                    body
                ],
            );
            match result {
                Ok(_) => Ok(message),
                Err(e) if is_constraint_violation(&e) => {
                    Err(PersistenceError::DuplicateMessage { id: message.id })
                }
                Err(e) => Err(backend_err(e)),
            }
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Message>, PersistenceError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        on_blocking_pool(move || {
            let body: Option<String> = conn
                .lock()
                .query_row("SELECT body FROM messages WHERE id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(backend_err)?;
            body.as_deref().map(decode_message).transpose()
        })
        .await
    }

    async fn find_by_chat_id(
        &self,
        chat_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError> {
        self.page_query(
            "SELECT body FROM messages WHERE chat_id = ?1
             ORDER BY created_at, id LIMIT ?2 OFFSET ?3",
            chat_id,
            page,
        )
        .await
    }

    async fn find_by_thread_id(
        &self,
        thread_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError> {
        self.page_query(
            "SELECT body FROM messages WHERE thread_id = ?1
             ORDER BY created_at, id LIMIT ?2 OFFSET ?3",
            thread_id,
            page,
        )
        .await
    }
}

impl SqliteStore {
    async fn page_query(
        &self,
        sql: &'static str,
        key: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        on_blocking_pool(move || {
            let guard = conn.lock();
            let mut statement = guard.prepare_cached(sql).map_err(backend_err)?;
            let rows = statement
                .query_map(
                    params![key, page.limit as i64, page.offset as i64],
                    |row| row.get::<_, String>(0),
                )
                .map_err(backend_err)?;
            let mut messages = Vec::new();
            for body in rows {
                messages.push(decode_message(&body.map_err(backend_err)?)?);
            }
            Ok(messages)
        })
        .await
    }
}

#[async_trait]
impl ThreadRepository for SqliteStore {
    async fn create_thread(&self, thread: &Thread) -> Result<Thread, PersistenceError> {
        let conn = self.conn.clone();
        let thread = thread.clone();
        on_blocking_pool(move || {
            let body = serde_json::to_string(&thread).map_err(backend_err)?;
            let result = conn.lock().execute(
                "INSERT INTO threads (id, parent_message_id, chat_id, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![thread.id, thread.parent_message_id, thread.chat_id, body],
            );
            match result {
                Ok(_) => Ok(thread),
                Err(e) if is_constraint_violation(&e) => Err(PersistenceError::DuplicateThread {
                    parent_message_id: thread.parent_message_id,
                }),
                Err(e) => Err(backend_err(e)),
            }
        })
        .await
    }

    async fn update_thread(&self, thread: &Thread) -> Result<(), PersistenceError> {
        let conn = self.conn.clone();
        let thread = thread.clone();
        on_blocking_pool(move || {
            let body = serde_json::to_string(&thread).map_err(backend_err)?;
            let changed = conn
                .lock()
                .execute(
                    "UPDATE threads SET body = ?2 WHERE id = ?1",
                    params![thread.id, body],
                )
                .map_err(backend_err)?;
            if changed == 0 {
                return Err(PersistenceError::ThreadNotFound { id: thread.id });
            }
            Ok(())
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Thread>, PersistenceError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        on_blocking_pool(move || {
            let body: Option<String> = conn
                .lock()
                .query_row("SELECT body FROM threads WHERE id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(backend_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(backend_err))
                .transpose()
        })
        .await
    }

    async fn find_by_parent_message_id(
        &self,
        parent_message_id: &str,
    ) -> Result<Option<Thread>, PersistenceError> {
        let conn = self.conn.clone();
        let parent = parent_message_id.to_string();
        on_blocking_pool(move || {
            let body: Option<String> = conn
                .lock()
                .query_row(
                    "SELECT body FROM threads WHERE parent_message_id = ?1",
                    [&parent],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(backend_err))
                .transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageMetadata;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn message(id: &str, chat_id: &str, thread_id: Option<&str>) -> Message {
        Message {
            id: id.into(),
            chat_id: chat_id.into(),
            sender_id: "u1".into(),
            content: "hello".into(),
            thread_id: thread_id.map(Into::into),
            created_at: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    #[tokio::test]
    async fn message_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sent = message("m1", "c1", Some("t1"));
        sent.metadata.push_mention("foodie");
        store.create_message(&sent).await.unwrap();

        let found = MessageRepository::find_by_id(&store, "m1").await.unwrap().unwrap();
        assert_eq!(found, sent);
    }

    #[tokio::test]
    async fn duplicate_message_maps_to_typed_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let m = message("m1", "c1", None);
        store.create_message(&m).await.unwrap();
        assert_eq!(
            store.create_message(&m).await,
            Err(PersistenceError::DuplicateMessage { id: "m1".into() })
        );
    }

    #[tokio::test]
    async fn chat_and_thread_pagination() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..6 {
            let thread_id = if i % 2 == 0 { Some("t1") } else { None };
            store
                .create_message(&message(&format!("m{i}"), "c1", thread_id))
                .await
                .unwrap();
        }

        let chat_page = store.find_by_chat_id("c1", Page::new(2, 2)).await.unwrap();
        assert_eq!(chat_page.len(), 2);

        let thread_page = store
            .find_by_thread_id("t1", Page::default())
            .await
            .unwrap();
        let ids: Vec<&str> = thread_page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m2", "m4"]);
    }

    #[tokio::test]
    async fn thread_unique_parent_enforced() {
        let store = SqliteStore::open_in_memory().unwrap();
        let thread =
            Thread::new("p1", "c1", BTreeSet::from(["u1".to_string()])).unwrap();
        store.create_thread(&thread).await.unwrap();

        let rival =
            Thread::new("p1", "c1", BTreeSet::from(["u2".to_string()])).unwrap();
        assert_eq!(
            store.create_thread(&rival).await,
            Err(PersistenceError::DuplicateThread {
                parent_message_id: "p1".into()
            })
        );
    }

    #[tokio::test]
    async fn update_persists_thread_mutations() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut thread =
            Thread::new("p1", "c1", BTreeSet::from(["u1".to_string()])).unwrap();
        store.create_thread(&thread).await.unwrap();

        thread.record_message("u2");
        store.update_thread(&thread).await.unwrap();

        let found = store
            .find_by_parent_message_id("p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.metadata.message_count, 1);
        assert!(found.metadata.participant_ids.contains("u2"));
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .create_message(&message("m1", "c1", None))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(MessageRepository::find_by_id(&store, "m1").await.unwrap().is_some());
    }
}
