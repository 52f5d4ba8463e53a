//! Process-local store for tests and single-node dev runs.

use super::{MessageRepository, Page, PersistenceError, ThreadRepository};
use crate::model::{Message, Thread};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct StoreState {
    messages: HashMap<String, Message>,
    /// Message ids per chat in insertion order.
    chat_order: HashMap<String, Vec<String>>,
    /// Message ids per thread in insertion order.
    thread_order: HashMap<String, Vec<String>>,
    threads: HashMap<String, Thread>,
    threads_by_parent: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }
}

fn page_of(ids: &[String], messages: &HashMap<String, Message>, page: Page) -> Vec<Message> {
    ids.iter()
        .skip(page.offset)
        .take(page.limit)
        .filter_map(|id| messages.get(id).cloned())
        .collect()
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn create_message(&self, message: &Message) -> Result<Message, PersistenceError> {
        let mut state = self.inner.lock();
        if state.messages.contains_key(&message.id) {
            return Err(PersistenceError::DuplicateMessage {
                id: message.id.clone(),
            });
        }
        state
            .chat_order
            .entry(message.chat_id.clone())
            .or_default()
            .push(message.id.clone());
        if let Some(thread_id) = &message.thread_id {
            state
                .thread_order
                .entry(thread_id.clone())
                .or_default()
                .push(message.id.clone());
        }
        state.messages.insert(message.id.clone(), message.clone());
        Ok(message.clone())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Message>, PersistenceError> {
        Ok(self.inner.lock().messages.get(id).cloned())
    }

    async fn find_by_chat_id(
        &self,
        chat_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError> {
        let state = self.inner.lock();
        Ok(state
            .chat_order
            .get(chat_id)
            .map(|ids| page_of(ids, &state.messages, page))
            .unwrap_or_default())
    }

    async fn find_by_thread_id(
        &self,
        thread_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError> {
        let state = self.inner.lock();
        Ok(state
            .thread_order
            .get(thread_id)
            .map(|ids| page_of(ids, &state.messages, page))
            .unwrap_or_default())
    }
}

#[async_trait]
impl ThreadRepository for InMemoryStore {
    async fn create_thread(&self, thread: &Thread) -> Result<Thread, PersistenceError> {
        let mut state = self.inner.lock();
        if state
            .threads_by_parent
            .contains_key(&thread.parent_message_id)
        {
            return Err(PersistenceError::DuplicateThread {
                parent_message_id: thread.parent_message_id.clone(),
            });
        }
        state
            .threads_by_parent
            .insert(thread.parent_message_id.clone(), thread.id.clone());
        state.threads.insert(thread.id.clone(), thread.clone());
        Ok(thread.clone())
    }

    async fn update_thread(&self, thread: &Thread) -> Result<(), PersistenceError> {
        let mut state = self.inner.lock();
        if !state.threads.contains_key(&thread.id) {
            return Err(PersistenceError::ThreadNotFound {
                id: thread.id.clone(),
            });
        }
        state.threads.insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Thread>, PersistenceError> {
        Ok(self.inner.lock().threads.get(id).cloned())
    }

    async fn find_by_parent_message_id(
        &self,
        parent_message_id: &str,
    ) -> Result<Option<Thread>, PersistenceError> {
        let state = self.inner.lock();
        Ok(state
            .threads_by_parent
            .get(parent_message_id)
            .and_then(|id| state.threads.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageMetadata;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn message(id: &str, chat_id: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: chat_id.into(),
            sender_id: "u1".into(),
            content: "hello".into(),
            thread_id: None,
            created_at: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_message_id_rejected() {
        let store = InMemoryStore::new();
        store.create_message(&message("m1", "c1")).await.unwrap();
        assert_eq!(
            store.create_message(&message("m1", "c1")).await,
            Err(PersistenceError::DuplicateMessage { id: "m1".into() })
        );
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn chat_pages_preserve_insertion_order() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .create_message(&message(&format!("m{i}"), "c1"))
                .await
                .unwrap();
        }
        let page = store
            .find_by_chat_id("c1", Page::new(1, 2))
            .await
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn one_thread_per_parent_message() {
        let store = InMemoryStore::new();
        let thread =
            Thread::new("p1", "c1", BTreeSet::from(["u1".to_string()])).unwrap();
        store.create_thread(&thread).await.unwrap();

        let second =
            Thread::new("p1", "c1", BTreeSet::from(["u2".to_string()])).unwrap();
        assert_eq!(
            store.create_thread(&second).await,
            Err(PersistenceError::DuplicateThread {
                parent_message_id: "p1".into()
            })
        );

        let found = store.find_by_parent_message_id("p1").await.unwrap();
        assert_eq!(found.map(|t| t.id), Some(thread.id));
    }

    #[tokio::test]
    async fn update_requires_existing_thread() {
        let store = InMemoryStore::new();
        let thread =
            Thread::new("p1", "c1", BTreeSet::from(["u1".to_string()])).unwrap();
        assert_eq!(
            store.update_thread(&thread).await,
            Err(PersistenceError::ThreadNotFound {
                id: thread.id.clone()
            })
        );
    }
}
