#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::uninlined_format_args,
    clippy::unused_async,
    clippy::cast_possible_truncation
)]

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod events;
pub mod gateway;
pub mod mentions;
pub mod model;
pub mod pipeline;
pub mod rooms;
pub mod service;
pub mod storage;
pub mod threads;

pub use broadcast::{
    Broadcaster, DeliveryError, InProcessRelay, Relay, RelayEnvelope, RelayPayload, RELAY_TOPIC,
};
pub use cache::{Cache, CacheCoordinator, InMemoryCache};
pub use config::Config;
pub use delivery::{
    DeliveryRecord, DeliveryStats, DeliveryStatus, DeliveryTracker, RetryQueue, RetryQueueItem,
    RetrySweeper, MAX_RETRY_ATTEMPTS, RETRY_DELAY_SECS,
};
pub use events::{ClientEvent, ServerEvent};
pub use mentions::{
    extract_mentions, EnrichedMetadata, HttpMentionDispatcher, MentionDispatcher,
    NoopMentionDispatcher,
};
pub use model::{
    Message, MessageMetadata, MessageType, Thread, ThreadMetadata, ThreadStatus, ValidationError,
};
pub use pipeline::{SendError, SendPipeline};
pub use rooms::{chat_room, thread_room, ConnectionHandle, RoomRegistry};
pub use service::ChatService;
pub use storage::{
    InMemoryStore, MessageRepository, Page, PersistenceError, SqliteStore, StoreHandles,
    ThreadRepository,
};
pub use threads::{ThreadError, ThreadStateMachine};
