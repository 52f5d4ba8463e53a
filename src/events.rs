//! Socket event protocol.
//!
//! ```text
//! Client -> Server: {"type":"new-message","id":"m1","chatId":"c1","senderId":"u1","content":"hi"}
//! Client -> Server: {"type":"message-delivered","messageId":"m1"}
//! Client -> Server: {"type":"join-chat","chatId":"c1"}
//! Server -> Client: {"type":"new-message","message":{...}}
//! Server -> Client: {"type":"message-sent","messageId":"m1","timestamp":"..."}
//! Server -> Client: {"type":"message-failed","messageId":"m1","error":"..."}
//! ```
//!
//! Disconnect has no frame; the service reacts to the socket closing.

use crate::delivery::{DeliveryRecord, DeliveryStatus};
use crate::model::{Message, MessageMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events a client may submit over its socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    NewMessage {
        id: String,
        chat_id: String,
        sender_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default)]
        metadata: MessageMetadata,
    },
    MessageDelivered {
        message_id: String,
    },
    JoinChat {
        chat_id: String,
    },
    LeaveChat {
        chat_id: String,
    },
    JoinThread {
        thread_id: String,
    },
}

/// Events pushed to clients through their outbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Broadcast of a persisted message to its chat room.
    NewMessage { message: Message },
    /// Same payload, scoped to the thread room.
    ThreadMessage { message: Message },
    /// Acknowledgment to the submitting client.
    MessageSent {
        message_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Delivery-state change fanned out to the chat room.
    MessageStatus {
        message_id: String,
        status: DeliveryStatus,
        timestamp: DateTime<Utc>,
    },
    /// The retry budget is exhausted; clients may offer a manual resend.
    MessageFailed { message_id: String, error: String },
    /// The send itself was rejected (validation, locked thread, storage down).
    MessageError { message_id: String, error: String },
}

impl ServerEvent {
    pub fn status_of(record: &DeliveryRecord) -> Self {
        Self::MessageStatus {
            message_id: record.message_id.clone(),
            status: record.status,
            timestamp: record.last_attempt_at,
        }
    }
}
