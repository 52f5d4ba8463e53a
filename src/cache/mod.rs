//! Shared cache keys and the read-through/write-through coordinator.
//!
//! Key formats:
//! `message:{id}`, `thread:{id}`, `delivery:{messageId}`,
//! `messages:chat:{chatId}:{offset}:{limit}`,
//! `messages:thread:{threadId}:{offset}:{limit}`.
//!
//! Any insert invalidates every list key in the affected chat/thread scope —
//! an insert can shift pagination, ordering and counts anywhere in the scope,
//! so precision is traded for correctness.

pub mod memory;
#[cfg(feature = "cache-redis")]
pub mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "cache-redis")]
pub use redis::RedisCache;

use crate::delivery::DeliveryRecord;
use crate::model::{Message, Thread};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Cache collaborator boundary. Backends log their own failures; a broken
/// cache degrades to misses and never fails the pipeline.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn delete(&self, key: &str);
    /// Remove every key under `prefix`.
    async fn delete_prefix(&self, prefix: &str);
}

pub mod keys {
    pub fn message(id: &str) -> String {
        format!("message:{id}")
    }

    pub fn thread(id: &str) -> String {
        format!("thread:{id}")
    }

    pub fn delivery(message_id: &str) -> String {
        format!("delivery:{message_id}")
    }

    pub fn chat_page(chat_id: &str, offset: usize, limit: usize) -> String {
        format!("messages:chat:{chat_id}:{offset}:{limit}")
    }

    pub fn thread_page(thread_id: &str, offset: usize, limit: usize) -> String {
        format!("messages:thread:{thread_id}:{offset}:{limit}")
    }

    /// Prefix covering every chat list page.
    pub fn chat_scope(chat_id: &str) -> String {
        format!("messages:chat:{chat_id}:")
    }

    /// Prefix covering every thread list page.
    pub fn thread_scope(thread_id: &str) -> String {
        format!("messages:thread:{thread_id}:")
    }
}

/// Owns cache policy: TTLs per entry class and the invalidation scopes of
/// the write path.
pub struct CacheCoordinator {
    cache: Arc<dyn Cache>,
    list_ttl: Duration,
    item_ttl: Duration,
}

impl CacheCoordinator {
    pub fn new(cache: Arc<dyn Cache>, list_ttl: Duration, item_ttl: Duration) -> Self {
        Self {
            cache,
            list_ttl,
            item_ttl,
        }
    }

    /// Write path: store the single-item entry and invalidate the list pages
    /// of the chat (and thread) the message landed in.
    pub async fn store_message(&self, message: &Message) {
        self.remember_message(message).await;
        self.cache
            .delete_prefix(&keys::chat_scope(&message.chat_id))
            .await;
        if let Some(thread_id) = &message.thread_id {
            self.cache
                .delete_prefix(&keys::thread_scope(thread_id))
                .await;
        }
    }

    /// Read path: refresh the single-item entry without touching list pages.
    pub async fn remember_message(&self, message: &Message) {
        if let Ok(body) = serde_json::to_string(message) {
            self.cache
                .set(&keys::message(&message.id), body, self.item_ttl)
                .await;
        }
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        let key = keys::message(id);
        let body = self.cache.get(&key).await?;
        match serde_json::from_str(&body) {
            Ok(message) => Some(message),
            Err(error) => {
                warn!(%key, %error, "dropping undecodable cache entry");
                self.cache.delete(&key).await;
                None
            }
        }
    }

    pub async fn store_thread(&self, thread: &Thread) {
        if let Ok(body) = serde_json::to_string(thread) {
            self.cache
                .set(&keys::thread(&thread.id), body, self.item_ttl)
                .await;
        }
    }

    /// Mirror a delivery-state change so sibling instances can serve lookups.
    pub async fn store_delivery(&self, record: &DeliveryRecord) {
        if let Ok(body) = serde_json::to_string(record) {
            self.cache
                .set(&keys::delivery(&record.message_id), body, self.item_ttl)
                .await;
        }
    }

    pub async fn page(&self, key: &str) -> Option<Vec<Message>> {
        let body = self.cache.get(key).await?;
        match serde_json::from_str(&body) {
            Ok(messages) => Some(messages),
            Err(error) => {
                warn!(%key, %error, "dropping undecodable cache entry");
                self.cache.delete(key).await;
                None
            }
        }
    }

    pub async fn store_page(&self, key: &str, messages: &[Message]) {
        if let Ok(body) = serde_json::to_string(messages) {
            self.cache.set(key, body, self.list_ttl).await;
        }
    }
}
