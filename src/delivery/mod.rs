//! Per-message delivery tracking.
//!
//! State machine per message: `pending -> delivered` on client ack, or
//! `pending -> failed` once the retry budget is gone. Both are terminal; a
//! bounded memory of terminal ids keeps a finished message from ever
//! re-entering `pending` through a late re-registration.

pub mod retry;

pub use retry::{RetryQueue, RetryQueueItem, RetrySweeper, MAX_RETRY_ATTEMPTS, RETRY_DELAY_SECS};

use crate::model::Message;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Terminal ids remembered after their record is dropped.
const MAX_TERMINAL_IDS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Transient tracking entry for one message in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub message_id: String,
    /// Broadcast attempts made so far, starting at 1.
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryStateError {
    #[error("no delivery record for message `{message_id}`")]
    UnknownMessage { message_id: String },
    #[error("delivery for message `{message_id}` is already {status:?}")]
    AlreadyTerminal {
        message_id: String,
        status: DeliveryStatus,
    },
}

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub registered_total: u64,
    pub delivered_total: u64,
    pub failed_total: u64,
    pub retry_attempts_total: u64,
}

#[derive(Debug, Clone)]
struct Tracked {
    record: DeliveryRecord,
    message: Message,
}

#[derive(Default)]
struct TrackerState {
    records: HashMap<String, Tracked>,
    terminal: HashMap<String, DeliveryStatus>,
    terminal_order: VecDeque<String>,
    stats: DeliveryStats,
}

/// In-memory map of message id to delivery state. Owned by one service
/// instance; records are created when a send is initiated and dropped as
/// their terminal result is surfaced.
#[derive(Default)]
pub struct DeliveryTracker {
    inner: Mutex<TrackerState>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pending record for a freshly initiated send. Returns false
    /// (and changes nothing) when the message is already tracked or already
    /// reached a terminal state — the retry path re-registers nothing.
    pub fn register(&self, message: &Message) -> bool {
        let mut state = self.inner.lock();
        if state.records.contains_key(&message.id) || state.terminal.contains_key(&message.id) {
            return false;
        }
        state.records.insert(
            message.id.clone(),
            Tracked {
                record: DeliveryRecord {
                    message_id: message.id.clone(),
                    attempts: 1,
                    last_attempt_at: Utc::now(),
                    status: DeliveryStatus::Pending,
                    error: None,
                },
                message: message.clone(),
            },
        );
        state.stats.registered_total += 1;
        true
    }

    /// Client acknowledgment: `pending -> delivered`. The record is removed
    /// (the caller surfaces the result in the same breath) and the id is
    /// remembered as terminal.
    pub fn mark_delivered(
        &self,
        message_id: &str,
    ) -> Result<(DeliveryRecord, Message), DeliveryStateError> {
        let mut state = self.inner.lock();
        let Some(mut tracked) = state.records.remove(message_id) else {
            if let Some(status) = state.terminal.get(message_id) {
                return Err(DeliveryStateError::AlreadyTerminal {
                    message_id: message_id.to_string(),
                    status: *status,
                });
            }
            return Err(DeliveryStateError::UnknownMessage {
                message_id: message_id.to_string(),
            });
        };
        tracked.record.status = DeliveryStatus::Delivered;
        tracked.record.last_attempt_at = Utc::now();
        remember_terminal(&mut state, message_id, DeliveryStatus::Delivered);
        state.stats.delivered_total += 1;
        Ok((tracked.record, tracked.message))
    }

    /// Retry budget exhausted: `pending -> failed`. Returns None when the
    /// message was never tracked or already terminal (e.g. an ack won the
    /// race against the final retry).
    pub fn mark_failed(
        &self,
        message_id: &str,
        error: impl Into<String>,
    ) -> Option<DeliveryRecord> {
        let mut state = self.inner.lock();
        let mut tracked = state.records.remove(message_id)?;
        tracked.record.status = DeliveryStatus::Failed;
        tracked.record.error = Some(error.into());
        tracked.record.last_attempt_at = Utc::now();
        remember_terminal(&mut state, message_id, DeliveryStatus::Failed);
        state.stats.failed_total += 1;
        Some(tracked.record)
    }

    /// Account one more broadcast attempt for a still-pending message.
    pub fn record_attempt(&self, message_id: &str) -> Option<DeliveryRecord> {
        let mut state = self.inner.lock();
        let tracked = state.records.get_mut(message_id)?;
        tracked.record.attempts += 1;
        tracked.record.last_attempt_at = Utc::now();
        let record = tracked.record.clone();
        state.stats.retry_attempts_total += 1;
        Some(record)
    }

    /// Live or remembered-terminal status.
    pub fn status(&self, message_id: &str) -> Option<DeliveryStatus> {
        let state = self.inner.lock();
        state
            .records
            .get(message_id)
            .map(|t| t.record.status)
            .or_else(|| state.terminal.get(message_id).copied())
    }

    pub fn record(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.inner
            .lock()
            .records
            .get(message_id)
            .map(|t| t.record.clone())
    }

    /// Messages still pending that were originated by `sender_id`. Used when
    /// that sender's socket disconnects and the ack path disappears.
    pub fn pending_for_sender(&self, sender_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|t| t.message.sender_id == sender_id)
            .map(|t| t.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.inner.lock().stats
    }
}

fn remember_terminal(state: &mut TrackerState, message_id: &str, status: DeliveryStatus) {
    if state.terminal.len() >= MAX_TERMINAL_IDS {
        if let Some(evicted) = state.terminal_order.pop_front() {
            state.terminal.remove(&evicted);
        }
    }
    state.terminal.insert(message_id.to_string(), status);
    state.terminal_order.push_back(message_id.to_string());
}
