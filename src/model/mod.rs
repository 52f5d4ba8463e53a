//! Core data model: messages, threads, and their validation rules.
//!
//! A [`Message`] is the unit of delivery; a [`Thread`] is a sub-conversation
//! anchored to exactly one parent message. Both are owned by the repository
//! collaborators in [`crate::storage`] — this module only defines shape and
//! invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

/// Inclusive content length bounds, in characters.
pub const MIN_CONTENT_CHARS: usize = 1;
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Ids are caller-assigned opaque tokens; keep them shell- and URL-safe.
const MAX_ID_CHARS: usize = 128;

/// Message kind carried in [`MessageMetadata`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    AiResponse,
    Poll,
    System,
}

/// Per-message metadata: type, formatting hints, mention set, AI context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageMetadata {
    pub message_type: MessageType,
    pub formatting: BTreeMap<String, String>,
    /// Mentioned user/agent ids, insertion-ordered, no duplicates.
    pub mentions: Vec<String>,
    pub ai_context: BTreeMap<String, serde_json::Value>,
}

impl MessageMetadata {
    /// Append a mention id, preserving order and uniqueness.
    pub fn push_mention(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.mentions.contains(&id) {
            self.mentions.push(id);
        }
    }
}

/// A chat message as submitted by a client and persisted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Check shape invariants before the pipeline performs any side effect.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_id(&self.id, "id")?;
        check_id(&self.chat_id, "chatId")?;
        check_id(&self.sender_id, "senderId")?;
        if let Some(thread_id) = &self.thread_id {
            check_id(thread_id, "threadId")?;
        }

        let chars = self.content.chars().count();
        if !(MIN_CONTENT_CHARS..=MAX_CONTENT_CHARS).contains(&chars) {
            return Err(ValidationError::ContentLength { chars });
        }

        if self.metadata.message_type == MessageType::AiResponse {
            let ctx = &self.metadata.ai_context;
            if !ctx.contains_key("model") || !ctx.contains_key("confidence") {
                return Err(ValidationError::IncompleteAiContext);
            }
        }

        Ok(())
    }
}

fn check_id(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    let well_formed = value.len() <= MAX_ID_CHARS
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !well_formed {
        return Err(ValidationError::MalformedId { field });
    }
    Ok(())
}

/// Input rejected before any side effect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("content must be {MIN_CONTENT_CHARS}..={MAX_CONTENT_CHARS} characters, got {chars}")]
    ContentLength { chars: usize },
    #[error("field `{field}` must not be empty")]
    EmptyField { field: &'static str },
    #[error("field `{field}` must contain only alphanumerics, `-` or `_` (max {MAX_ID_CHARS} chars)")]
    MalformedId { field: &'static str },
    #[error("AI_RESPONSE messages require `model` and `confidence` in ai_context")]
    IncompleteAiContext,
    #[error("thread requires at least one initial participant")]
    NoParticipants,
}

/// Thread lifecycle status. Transitions are enforced by
/// [`crate::threads::ThreadStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    Active,
    Archived,
    Locked,
}

impl ThreadStatus {
    /// Allowed transitions:
    /// ACTIVE -> {ARCHIVED, LOCKED}, ARCHIVED -> {ACTIVE}, LOCKED -> {}.
    pub fn can_transition_to(self, next: ThreadStatus) -> bool {
        matches!(
            (self, next),
            (ThreadStatus::Active, ThreadStatus::Archived)
                | (ThreadStatus::Active, ThreadStatus::Locked)
                | (ThreadStatus::Archived, ThreadStatus::Active)
        )
    }
}

/// Mutable thread metadata. `message_count` only increases and
/// `participant_ids` only grows under normal message flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMetadata {
    pub status: ThreadStatus,
    pub participant_ids: BTreeSet<String>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: u64,
}

/// A sub-conversation anchored to one parent message. Created once, mutated
/// by every message addressed to it, never hard-deleted (archival is a
/// status, not removal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub parent_message_id: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: ThreadMetadata,
}

impl Thread {
    /// Build a fresh ACTIVE thread with zero messages.
    pub fn new(
        parent_message_id: impl Into<String>,
        chat_id: impl Into<String>,
        initial_participants: BTreeSet<String>,
    ) -> Result<Self, ValidationError> {
        if initial_participants.is_empty() {
            return Err(ValidationError::NoParticipants);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            parent_message_id: parent_message_id.into(),
            chat_id: chat_id.into(),
            created_at: now,
            metadata: ThreadMetadata {
                status: ThreadStatus::Active,
                participant_ids: initial_participants,
                last_activity_at: now,
                message_count: 0,
            },
        })
    }

    /// Account for one message: bump the count, add the sender (set-idempotent),
    /// refresh activity.
    pub fn record_message(&mut self, sender_id: &str) {
        self.metadata.message_count += 1;
        self.metadata.participant_ids.insert(sender_id.to_string());
        self.metadata.last_activity_at = Utc::now();
    }
}
