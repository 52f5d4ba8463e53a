//! Repository collaborators owning durable Message and Thread records.
//!
//! Two backends, selected by `[storage]` config: `memory` (process-local,
//! tests and dev) and `sqlite`. Both stores tolerate concurrent writers at
//! per-key granularity; everything beyond that is the caller's concern.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::config::StorageConfig;
use crate::model::{Message, Thread};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 200;

/// Offset/limit window for paginated queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

/// Storage collaborator failure. `Unavailable` is the retryable class; the
/// rest are constraint violations surfaced as-is.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("message `{id}` already persisted")]
    DuplicateMessage { id: String },
    #[error("thread already exists for parent message `{parent_message_id}`")]
    DuplicateThread { parent_message_id: String },
    #[error("thread `{id}` not found")]
    ThreadNotFound { id: String },
    #[error("storage backend unavailable: {reason}")]
    Unavailable { reason: String },
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Durably store a new message. Message ids are unique and assigned once;
    /// a second insert with the same id fails with `DuplicateMessage`.
    async fn create_message(&self, message: &Message) -> Result<Message, PersistenceError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Message>, PersistenceError>;

    /// Messages of a chat in creation order.
    async fn find_by_chat_id(
        &self,
        chat_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError>;

    /// Messages of a thread in creation order.
    async fn find_by_thread_id(
        &self,
        thread_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError>;
}

#[async_trait]
pub trait ThreadRepository: Send + Sync {
    /// Store a new thread; one thread per parent message, enforced here.
    async fn create_thread(&self, thread: &Thread) -> Result<Thread, PersistenceError>;

    /// Replace the stored thread state.
    async fn update_thread(&self, thread: &Thread) -> Result<(), PersistenceError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Thread>, PersistenceError>;

    async fn find_by_parent_message_id(
        &self,
        parent_message_id: &str,
    ) -> Result<Option<Thread>, PersistenceError>;
}

/// The two repository handles of one configured store.
#[derive(Clone)]
pub struct StoreHandles {
    pub messages: Arc<dyn MessageRepository>,
    pub threads: Arc<dyn ThreadRepository>,
}

/// Open the configured backend. Unknown backend names fall back to `memory`
/// with a warning rather than refusing to start.
pub fn open_store(config: &StorageConfig) -> anyhow::Result<StoreHandles> {
    match config.backend.as_str() {
        "sqlite" => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from("noshchat.db"));
            let store = Arc::new(SqliteStore::open(&path)?);
            Ok(StoreHandles {
                messages: store.clone(),
                threads: store,
            })
        }
        "memory" => Ok(in_memory_handles()),
        other => {
            warn!("unknown storage backend `{other}`, falling back to memory");
            Ok(in_memory_handles())
        }
    }
}

fn in_memory_handles() -> StoreHandles {
    let store = Arc::new(InMemoryStore::new());
    StoreHandles {
        messages: store.clone(),
        threads: store,
    }
}
