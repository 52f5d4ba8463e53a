//! Message fan-out: local socket rooms plus the cross-instance relay.
//!
//! `publish` always feeds both channels: the local rooms synchronously, then
//! the shared `message-updates` topic so sibling instances can reach the
//! sockets they hold. Relay envelopes carry the origin instance id; each
//! consumer drops its own echoes, so a locally-joined socket sees one copy.
//!
//! A per-socket write failure is logged and skipped. A relay publish failure
//! is a delivery failure for the whole message and feeds the retry queue.

#[cfg(feature = "cache-redis")]
pub mod redis;

#[cfg(feature = "cache-redis")]
pub use redis::RedisRelay;

use crate::events::ServerEvent;
use crate::model::Message;
use crate::rooms::{chat_room, thread_room, RoomRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared pub/sub topic for cross-instance message traffic.
pub const RELAY_TOPIC: &str = "message-updates";
const RELAY_BUFFER: usize = 256;

/// Broadcast or relay failure; retried through the retry queue, bounded at
/// the retry budget, then surfaced as `message-failed`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("relay publish failed: {reason}")]
    RelayUnavailable { reason: String },
}

/// Wire envelope on the relay topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Instance that published the envelope; consumers drop their own.
    pub origin: String,
    #[serde(flatten)]
    pub payload: RelayPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayPayload {
    NewMessage { message: Message },
}

/// Cross-instance pub/sub boundary.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), DeliveryError>;
    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope>;
}

/// Relay for single-instance deployments and tests: loops envelopes through
/// a process-local channel.
pub struct InProcessRelay {
    tx: broadcast::Sender<RelayEnvelope>,
}

impl InProcessRelay {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(RELAY_BUFFER);
        Self { tx }
    }
}

impl Default for InProcessRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for InProcessRelay {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), DeliveryError> {
        // No subscribers is fine: a lone instance has nobody to relay to.
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.tx.subscribe()
    }
}

/// Fans a persisted message out to local rooms and the relay.
pub struct Broadcaster {
    rooms: Arc<RoomRegistry>,
    relay: Arc<dyn Relay>,
    instance_id: String,
}

impl Broadcaster {
    pub fn new(rooms: Arc<RoomRegistry>, relay: Arc<dyn Relay>, instance_id: impl Into<String>) -> Self {
        Self {
            rooms,
            relay,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Deliver to both channels. Local fan-out cannot fail the message; the
    /// relay can, and its error is the caller's signal to queue a retry.
    pub async fn publish(&self, message: &Message) -> Result<(), DeliveryError> {
        self.fan_out_local(message);
        let envelope = RelayEnvelope {
            origin: self.instance_id.clone(),
            payload: RelayPayload::NewMessage {
                message: message.clone(),
            },
        };
        self.relay.publish(&envelope).await
    }

    /// Synchronous fan-out to the chat room, and the thread room if set.
    pub fn fan_out_local(&self, message: &Message) {
        let delivered = self.rooms.broadcast(
            &chat_room(&message.chat_id),
            &ServerEvent::NewMessage {
                message: message.clone(),
            },
        );
        debug!(message_id = %message.id, chat_id = %message.chat_id, delivered, "local fan-out");
        if let Some(thread_id) = &message.thread_id {
            self.rooms.broadcast(
                &thread_room(thread_id),
                &ServerEvent::ThreadMessage {
                    message: message.clone(),
                },
            );
        }
    }

    /// Push an arbitrary event to a chat room (delivery status, failures).
    pub fn emit(&self, chat_id: &str, event: &ServerEvent) -> usize {
        self.rooms.broadcast(&chat_room(chat_id), event)
    }

    /// Drain the relay, re-publishing remote messages to local rooms. Runs
    /// until cancelled; owned by the service lifecycle.
    pub async fn run_relay_consumer(&self, cancel: CancellationToken) {
        let mut rx = self.relay.subscribe();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(envelope) => {
                        if envelope.origin == self.instance_id {
                            continue;
                        }
                        let RelayPayload::NewMessage { message } = envelope.payload;
                        debug!(message_id = %message.id, origin = %envelope.origin, "relayed message");
                        self.fan_out_local(&message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay consumer lagged, messages dropped locally");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
