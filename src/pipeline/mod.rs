//! The send pipeline: mention extraction -> enrichment -> persistence ->
//! cache -> broadcast -> thread update -> delivery tracking.
//!
//! Side effects run in that order. Persistence is all-or-nothing: when the
//! backoff budget is exhausted nothing was cached, broadcast or tracked. A
//! broadcast failure after successful persistence does not fail the send; it
//! feeds the retry queue and is surfaced later as `message-failed`.

use crate::broadcast::Broadcaster;
use crate::cache::{keys, CacheCoordinator};
use crate::delivery::{DeliveryTracker, RetryQueue};
use crate::mentions::{extract_mentions, MentionDispatcher};
use crate::model::{Message, ValidationError};
use crate::storage::{MessageRepository, Page, PersistenceError};
use crate::threads::{ThreadError, ThreadStateMachine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("persistence failed after {attempts} attempts: {source}")]
    Persistence {
        attempts: u32,
        #[source]
        source: PersistenceError,
    },
    #[error(transparent)]
    Thread(#[from] ThreadError),
}

pub struct SendPipeline {
    repo: Arc<dyn MessageRepository>,
    threads: Arc<ThreadStateMachine>,
    cache: Arc<CacheCoordinator>,
    broadcaster: Arc<Broadcaster>,
    tracker: Arc<DeliveryTracker>,
    retries: Arc<RetryQueue>,
    mentions: Arc<dyn MentionDispatcher>,
    mention_budget: Duration,
    persist_attempts: u32,
    persist_backoff_base: Duration,
}

impl SendPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        threads: Arc<ThreadStateMachine>,
        cache: Arc<CacheCoordinator>,
        broadcaster: Arc<Broadcaster>,
        tracker: Arc<DeliveryTracker>,
        retries: Arc<RetryQueue>,
        mentions: Arc<dyn MentionDispatcher>,
    ) -> Self {
        Self {
            repo,
            threads,
            cache,
            broadcaster,
            tracker,
            retries,
            mentions,
            mention_budget: Duration::from_secs(2),
            persist_attempts: 3,
            persist_backoff_base: Duration::from_secs(1),
        }
    }

    /// Override the enrichment budget (default 2s).
    pub fn with_mention_budget(mut self, budget: Duration) -> Self {
        self.mention_budget = budget;
        self
    }

    /// Override persistence retry policy (default 3 attempts, 1s base,
    /// factor 2).
    pub fn with_persistence_policy(mut self, attempts: u32, backoff_base: Duration) -> Self {
        self.persist_attempts = attempts.max(1);
        self.persist_backoff_base = backoff_base;
        self
    }

    /// Run the full send. Returns the persisted message; delivery continues
    /// asynchronously (ack or retry path).
    pub async fn send(&self, mut message: Message) -> Result<Message, SendError> {
        message.validate()?;

        let mentioned = extract_mentions(&message.content);
        if !mentioned.is_empty() {
            for id in mentioned {
                message.metadata.push_mention(id);
            }
            self.enrich(&mut message).await;
        }

        // Gate locked/unknown threads before any side effect; the
        // post-broadcast update below re-checks under the per-thread lock.
        if let Some(thread_id) = message.thread_id.clone() {
            self.threads.ensure_accepts_messages(&thread_id).await?;
        }

        message.created_at = Utc::now();
        let persisted = self.persist_with_backoff(&message).await?;

        self.cache.store_message(&persisted).await;
        self.tracker.register(&persisted);

        if let Err(error) = self.broadcaster.publish(&persisted).await {
            warn!(message_id = %persisted.id, %error, "broadcast failed, queued for retry");
            self.retries.enqueue(persisted.clone(), 1);
        }

        if let Some(thread_id) = persisted.thread_id.clone() {
            match self.threads.add_message(&thread_id, &persisted.sender_id).await {
                Ok(thread) => self.cache.store_thread(&thread).await,
                // The thread can lock between the gate and here; the message
                // is already durable and broadcast, so log and move on.
                Err(error) => {
                    warn!(message_id = %persisted.id, %thread_id, %error, "thread update skipped");
                }
            }
        }

        if let Some(record) = self.tracker.record(&persisted.id) {
            self.cache.store_delivery(&record).await;
        }

        Ok(persisted)
    }

    /// Best-effort enrichment. Every failure path is a logged no-op; AI
    /// processing never blocks delivery.
    async fn enrich(&self, message: &mut Message) {
        match tokio::time::timeout(self.mention_budget, self.mentions.process(message)).await {
            Ok(Ok(enriched)) => {
                message.metadata.ai_context.extend(enriched.ai_context);
                message.metadata.formatting.extend(enriched.formatting);
                debug!(message_id = %message.id, "mention enrichment applied");
            }
            Ok(Err(error)) => {
                warn!(message_id = %message.id, %error, "mention dispatch failed, continuing");
            }
            Err(_) => {
                warn!(
                    message_id = %message.id,
                    budget_ms = self.mention_budget.as_millis() as u64,
                    "mention dispatch timed out, continuing"
                );
            }
        }
    }

    /// Persist with exponential backoff: each attempt is a full retry of the
    /// repository call. A duplicate-id response means an earlier attempt
    /// already committed; the stored row wins.
    async fn persist_with_backoff(&self, message: &Message) -> Result<Message, SendError> {
        let mut backoff = self.persist_backoff_base;
        let mut last_error = None;
        for attempt in 1..=self.persist_attempts {
            match self.repo.create_message(message).await {
                Ok(persisted) => return Ok(persisted),
                Err(PersistenceError::DuplicateMessage { .. }) => {
                    debug!(message_id = %message.id, "message already durable");
                    if let Ok(Some(existing)) = self.repo.find_by_id(&message.id).await {
                        return Ok(existing);
                    }
                    return Ok(message.clone());
                }
                Err(error) => {
                    warn!(message_id = %message.id, attempt, %error, "persistence attempt failed");
                    last_error = Some(error);
                    if attempt < self.persist_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(SendError::Persistence {
            attempts: self.persist_attempts,
            source: last_error.unwrap_or(PersistenceError::Unavailable {
                reason: "persistence attempts exhausted".to_string(),
            }),
        })
    }

    /// Single-message lookup, read-through.
    pub async fn message(&self, id: &str) -> Result<Option<Message>, PersistenceError> {
        if let Some(hit) = self.cache.message(id).await {
            return Ok(Some(hit));
        }
        let found = self.repo.find_by_id(id).await?;
        if let Some(message) = &found {
            self.cache.remember_message(message).await;
        }
        Ok(found)
    }

    /// Paginated chat history, read-through with per-page cache keys.
    pub async fn chat_messages(
        &self,
        chat_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError> {
        let key = keys::chat_page(chat_id, page.offset, page.limit);
        if let Some(hit) = self.cache.page(&key).await {
            return Ok(hit);
        }
        let rows = self.repo.find_by_chat_id(chat_id, page).await?;
        self.cache.store_page(&key, &rows).await;
        Ok(rows)
    }

    /// Paginated thread history, read-through with per-page cache keys.
    pub async fn thread_messages(
        &self,
        thread_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, PersistenceError> {
        let key = keys::thread_page(thread_id, page.offset, page.limit);
        if let Some(hit) = self.cache.page(&key).await {
            return Ok(hit);
        }
        let rows = self.repo.find_by_thread_id(thread_id, page).await?;
        self.cache.store_page(&key, &rows).await;
        Ok(rows)
    }
}
