//! Redis pub/sub relay, enabled with the `cache-redis` feature.
//!
//! Publishes envelopes on the shared [`RELAY_TOPIC`](super::RELAY_TOPIC)
//! channel and forwards inbound traffic into a process-local broadcast
//! channel so [`Relay::subscribe`] keeps the same shape as the in-process
//! relay.

use super::{DeliveryError, Relay, RelayEnvelope, RELAY_TOPIC};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::warn;

const RELAY_BUFFER: usize = 256;

pub struct RedisRelay {
    conn: ConnectionManager,
    tx: broadcast::Sender<RelayEnvelope>,
}

impl RedisRelay {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(RELAY_TOPIC).await?;

        let (tx, _rx) = broadcast::channel(RELAY_BUFFER);
        let fan_tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(%error, "undecodable relay frame");
                        continue;
                    }
                };
                match serde_json::from_str::<RelayEnvelope>(&payload) {
                    Ok(envelope) => {
                        let _ = fan_tx.send(envelope);
                    }
                    Err(error) => warn!(%error, "malformed relay envelope"),
                }
            }
            warn!("relay subscription stream ended");
        });

        Ok(Self { conn, tx })
    }
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string(envelope).map_err(|e| DeliveryError::RelayUnavailable {
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(RELAY_TOPIC, payload)
            .await
            .map_err(|e| DeliveryError::RelayUnavailable {
                reason: e.to_string(),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.tx.subscribe()
    }
}
