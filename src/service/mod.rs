//! Service assembly and the client event loop.
//!
//! One [`ChatService`] owns every moving part — rooms, tracker, retry queue,
//! broadcaster, thread state machine, cache coordinator, pipeline — as
//! explicit instances (no module-level singletons), so tests can substitute
//! any collaborator. `start` spawns the retry sweeper and the relay
//! consumer; `shutdown` cancels both and waits.

use crate::broadcast::{Broadcaster, InProcessRelay, Relay};
use crate::cache::{Cache, CacheCoordinator, InMemoryCache};
use crate::config::Config;
use crate::delivery::{DeliveryStats, DeliveryTracker, RetryQueue, RetrySweeper};
use crate::events::{ClientEvent, ServerEvent};
use crate::mentions::{HttpMentionDispatcher, MentionDispatcher, NoopMentionDispatcher};
use crate::model::Message;
use crate::pipeline::SendPipeline;
use crate::rooms::{chat_room, thread_room, ConnectionHandle, RoomRegistry};
use crate::storage::{open_store, StoreHandles};
use crate::threads::ThreadStateMachine;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ChatService {
    config: Config,
    rooms: Arc<RoomRegistry>,
    tracker: Arc<DeliveryTracker>,
    retries: Arc<RetryQueue>,
    broadcaster: Arc<Broadcaster>,
    threads: Arc<ThreadStateMachine>,
    cache: Arc<CacheCoordinator>,
    pipeline: Arc<SendPipeline>,
    sweeper: Arc<RetrySweeper>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatService {
    /// Build from config: opens the storage backend, the cache backend and
    /// the relay, and wires the mention collaborator if configured.
    pub async fn from_config(config: Config) -> anyhow::Result<Arc<Self>> {
        let stores = open_store(&config.storage)?;
        let cache = open_cache(&config).await?;
        let relay = open_relay(&config).await?;
        let dispatcher: Arc<dyn MentionDispatcher> = match &config.mentions.endpoint {
            Some(endpoint) => Arc::new(HttpMentionDispatcher::new(
                endpoint.clone(),
                config.mentions.timeout(),
            )?),
            None => Arc::new(NoopMentionDispatcher),
        };
        Ok(Self::with_collaborators(config, stores, cache, relay, dispatcher))
    }

    /// Assemble with explicit collaborators. Test entry point: substitute
    /// any repository, cache, relay or dispatcher.
    pub fn with_collaborators(
        config: Config,
        stores: StoreHandles,
        cache: Arc<dyn Cache>,
        relay: Arc<dyn Relay>,
        dispatcher: Arc<dyn MentionDispatcher>,
    ) -> Arc<Self> {
        let rooms = Arc::new(RoomRegistry::new());
        let tracker = Arc::new(DeliveryTracker::new());
        let retries = Arc::new(RetryQueue::new(
            config.delivery.retry_delay(),
            config.delivery.max_retry_attempts,
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            rooms.clone(),
            relay,
            config.instance_id.clone(),
        ));
        let threads = Arc::new(ThreadStateMachine::new(stores.threads));
        let coordinator = Arc::new(CacheCoordinator::new(
            cache,
            config.cache.list_ttl(),
            config.cache.item_ttl(),
        ));
        let pipeline = Arc::new(
            SendPipeline::new(
                stores.messages,
                threads.clone(),
                coordinator.clone(),
                broadcaster.clone(),
                tracker.clone(),
                retries.clone(),
                dispatcher,
            )
            .with_mention_budget(config.mentions.timeout())
            .with_persistence_policy(
                config.delivery.persist_attempts,
                config.delivery.persist_backoff_base(),
            ),
        );
        let sweeper = Arc::new(RetrySweeper::new(
            retries.clone(),
            tracker.clone(),
            broadcaster.clone(),
            coordinator.clone(),
            config.delivery.retry_delay(),
        ));

        Arc::new(Self {
            config,
            rooms,
            tracker,
            retries,
            broadcaster,
            threads,
            cache: coordinator,
            pipeline,
            sweeper,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background tasks: retry sweeper and relay consumer.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let sweeper = self.sweeper.clone();
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move { sweeper.run(cancel).await }));

        let broadcaster = self.broadcaster.clone();
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            broadcaster.run_relay_consumer(cancel).await;
        }));

        info!(instance = %self.config.instance_id, "chat service started");
    }

    /// Stop background tasks and wait for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(instance = %self.config.instance_id, "chat service stopped");
    }

    /// Register a socket: returns its handle and the outbound event stream
    /// the socket writer drains.
    pub fn register_connection(
        &self,
        sender_id: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(sender_id, tx);
        self.rooms.register(handle.clone());
        (handle, rx)
    }

    /// Socket gone: drop room memberships and route every still-pending
    /// delivery this client originated into the retry queue — the
    /// synchronous ack path no longer exists.
    pub async fn disconnect(&self, conn_id: &str) {
        let Some(conn) = self.rooms.unregister(conn_id) else {
            return;
        };
        for message in self.tracker.pending_for_sender(&conn.sender_id) {
            let attempts = self.tracker.record(&message.id).map_or(1, |r| r.attempts);
            if self.retries.enqueue_immediate(message, attempts) {
                debug!(connection = %conn_id, sender = %conn.sender_id, "pending delivery moved to retry queue");
            }
        }
    }

    /// Dispatch one inbound client event.
    pub async fn handle_event(&self, conn: &ConnectionHandle, event: ClientEvent) {
        match event {
            ClientEvent::NewMessage {
                id,
                chat_id,
                sender_id,
                content,
                thread_id,
                metadata,
            } => {
                let message = Message {
                    id: id.clone(),
                    chat_id,
                    sender_id,
                    content,
                    thread_id,
                    created_at: Utc::now(),
                    metadata,
                };
                match self.pipeline.send(message).await {
                    Ok(persisted) => {
                        conn.send(ServerEvent::MessageSent {
                            message_id: persisted.id,
                            timestamp: persisted.created_at,
                        });
                    }
                    Err(error) => {
                        warn!(message_id = %id, %error, "send rejected");
                        conn.send(ServerEvent::MessageError {
                            message_id: id,
                            error: error.to_string(),
                        });
                    }
                }
            }
            ClientEvent::MessageDelivered { message_id } => {
                match self.tracker.mark_delivered(&message_id) {
                    Ok((record, message)) => {
                        self.retries.remove(&message_id);
                        self.cache.store_delivery(&record).await;
                        self.broadcaster
                            .emit(&message.chat_id, &ServerEvent::status_of(&record));
                    }
                    Err(error) => debug!(message_id = %message_id, %error, "delivery ack ignored"),
                }
            }
            ClientEvent::JoinChat { chat_id } => {
                self.rooms.join(&chat_room(&chat_id), &conn.id);
            }
            ClientEvent::LeaveChat { chat_id } => {
                self.rooms.leave(&chat_room(&chat_id), &conn.id);
            }
            ClientEvent::JoinThread { thread_id } => {
                self.rooms.join(&thread_room(&thread_id), &conn.id);
            }
        }
    }

    pub fn pipeline(&self) -> &SendPipeline {
        &self.pipeline
    }

    pub fn threads(&self) -> &ThreadStateMachine {
        &self.threads
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retries
    }

    pub fn sweeper(&self) -> &RetrySweeper {
        &self.sweeper
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.tracker.stats()
    }
}

async fn open_cache(config: &Config) -> anyhow::Result<Arc<dyn Cache>> {
    match config.cache.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryCache::new())),
        #[cfg(feature = "cache-redis")]
        "redis" => {
            let url = config
                .cache
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("cache.url required for the redis backend"))?;
            Ok(Arc::new(crate::cache::RedisCache::connect(url).await?))
        }
        #[cfg(not(feature = "cache-redis"))]
        "redis" => {
            warn!("built without the cache-redis feature, falling back to memory cache");
            Ok(Arc::new(InMemoryCache::new()))
        }
        other => {
            warn!("unknown cache backend `{other}`, falling back to memory");
            Ok(Arc::new(InMemoryCache::new()))
        }
    }
}

async fn open_relay(config: &Config) -> anyhow::Result<Arc<dyn Relay>> {
    match config.cache.backend.as_str() {
        #[cfg(feature = "cache-redis")]
        "redis" => {
            let url = config
                .cache
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("cache.url required for the redis backend"))?;
            Ok(Arc::new(crate::broadcast::RedisRelay::connect(url).await?))
        }
        _ => Ok(Arc::new(InProcessRelay::new())),
    }
}
