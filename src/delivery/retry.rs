//! Bounded retry of failed broadcasts.
//!
//! The queue holds messages whose broadcast attempt raised an error, keyed by
//! message id. A sweeper task owned by the service lifecycle scans on a fixed
//! interval; due items are re-broadcast only — the message is already durable
//! and is never re-persisted. Attempts are capped at [`MAX_RETRY_ATTEMPTS`];
//! past the cap the delivery record goes `failed` and a `message-failed`
//! event is emitted to the chat room exactly once.

use super::DeliveryTracker;
use crate::broadcast::Broadcaster;
use crate::cache::CacheCoordinator;
use crate::events::ServerEvent;
use crate::model::Message;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Broadcast attempts per message before it is permanently failed.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
/// Fixed delay between attempts, and the sweep interval.
pub const RETRY_DELAY_SECS: u64 = 5;

/// A message awaiting re-broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryQueueItem {
    pub message: Message,
    /// Broadcast attempts already made.
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// Map of message id to pending retry, owned by one service instance.
pub struct RetryQueue {
    delay: ChronoDuration,
    max_attempts: u32,
    inner: Mutex<HashMap<String, RetryQueueItem>>,
}

impl RetryQueue {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay: ChronoDuration::from_std(delay)
                .unwrap_or_else(|_| ChronoDuration::seconds(RETRY_DELAY_SECS as i64)),
            max_attempts: max_attempts.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(RETRY_DELAY_SECS), MAX_RETRY_ATTEMPTS)
    }

    /// Queue a message whose broadcast failed, due after the fixed delay.
    /// No-op when the message is already queued.
    pub fn enqueue(&self, message: Message, attempts: u32) -> bool {
        self.enqueue_at(message, attempts, Utc::now() + self.delay)
    }

    /// Queue a message due on the very next sweep. Used when the originating
    /// socket disconnects and the synchronous ack path is gone.
    pub fn enqueue_immediate(&self, message: Message, attempts: u32) -> bool {
        self.enqueue_at(message, attempts, Utc::now())
    }

    fn enqueue_at(&self, message: Message, attempts: u32, next_retry_at: DateTime<Utc>) -> bool {
        let mut queue = self.inner.lock();
        if queue.contains_key(&message.id) {
            return false;
        }
        queue.insert(
            message.id.clone(),
            RetryQueueItem {
                message,
                attempts,
                next_retry_at,
            },
        );
        true
    }

    /// Items whose `next_retry_at` has passed.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<RetryQueueItem> {
        self.inner
            .lock()
            .values()
            .filter(|item| item.next_retry_at <= now)
            .cloned()
            .collect()
    }

    /// Bump attempts and push the deadline out by the fixed delay.
    pub fn reschedule(&self, message_id: &str, now: DateTime<Utc>) -> Option<u32> {
        let mut queue = self.inner.lock();
        let item = queue.get_mut(message_id)?;
        item.attempts += 1;
        item.next_retry_at = now + self.delay;
        Some(item.attempts)
    }

    pub fn remove(&self, message_id: &str) -> Option<RetryQueueItem> {
        self.inner.lock().remove(message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Ticker draining the retry queue, started by the service and stopped
/// through its cancellation token.
pub struct RetrySweeper {
    queue: Arc<RetryQueue>,
    tracker: Arc<DeliveryTracker>,
    broadcaster: Arc<Broadcaster>,
    cache: Arc<CacheCoordinator>,
    interval: Duration,
}

impl RetrySweeper {
    pub fn new(
        queue: Arc<RetryQueue>,
        tracker: Arc<DeliveryTracker>,
        broadcaster: Arc<Broadcaster>,
        cache: Arc<CacheCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            tracker,
            broadcaster,
            cache,
            interval,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "retry sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = self.sweep_once(Utc::now()).await;
                    if swept > 0 {
                        debug!(swept, "retry sweep pass");
                    }
                }
            }
        }
        info!("retry sweeper stopped");
    }

    /// One sweep pass over all due items; returns how many were processed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let due = self.queue.due(now);
        let count = due.len();
        for item in due {
            let message_id = item.message.id.clone();
            match self.broadcaster.publish(&item.message).await {
                Ok(()) => {
                    self.queue.remove(&message_id);
                    debug!(message_id = %message_id, "re-broadcast succeeded");
                }
                Err(error) => {
                    let attempts = item.attempts + 1;
                    if let Some(record) = self.tracker.record_attempt(&message_id) {
                        self.cache.store_delivery(&record).await;
                    }
                    if attempts >= self.queue.max_attempts() {
                        self.queue.remove(&message_id);
                        if let Some(record) =
                            self.tracker.mark_failed(&message_id, error.to_string())
                        {
                            self.cache.store_delivery(&record).await;
                            warn!(message_id = %message_id, %error, attempts, "delivery permanently failed");
                            self.broadcaster.emit(
                                &item.message.chat_id,
                                &ServerEvent::MessageFailed {
                                    message_id: message_id.clone(),
                                    error: error.to_string(),
                                },
                            );
                        }
                    } else {
                        self.queue.reschedule(&message_id, now);
                        debug!(message_id = %message_id, attempts, "retry rescheduled");
                    }
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageMetadata;

    fn message(id: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: "c1".into(),
            sender_id: "u1".into(),
            content: "hello".into(),
            thread_id: None,
            created_at: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    #[test]
    fn enqueue_is_idempotent_per_message_id() {
        let queue = RetryQueue::with_defaults();
        assert!(queue.enqueue(message("m1"), 1));
        assert!(!queue.enqueue(message("m1"), 2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn items_become_due_after_the_fixed_delay() {
        let queue = RetryQueue::with_defaults();
        let now = Utc::now();
        queue.enqueue(message("m1"), 1);
        assert!(queue.due(now).is_empty());
        assert_eq!(queue.due(now + ChronoDuration::seconds(5)).len(), 1);
    }

    #[test]
    fn immediate_items_are_due_on_next_sweep() {
        let queue = RetryQueue::with_defaults();
        queue.enqueue_immediate(message("m1"), 1);
        assert_eq!(queue.due(Utc::now()).len(), 1);
    }

    #[test]
    fn reschedule_bumps_attempts_and_deadline() {
        let queue = RetryQueue::with_defaults();
        let now = Utc::now();
        queue.enqueue_immediate(message("m1"), 1);
        assert_eq!(queue.reschedule("m1", now), Some(2));
        assert!(queue.due(now).is_empty());
        assert_eq!(queue.reschedule("ghost", now), None);
    }
}
