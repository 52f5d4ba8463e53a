//! Service-level tests: cross-instance relay fan-out and end-to-end mention
//! enrichment through the HTTP collaborator boundary.

use noshchat::broadcast::{InProcessRelay, Relay};
use noshchat::cache::InMemoryCache;
use noshchat::config::Config;
use noshchat::events::{ClientEvent, ServerEvent};
use noshchat::mentions::{HttpMentionDispatcher, MentionDispatcher, NoopMentionDispatcher};
use noshchat::service::ChatService;
use noshchat::storage::{InMemoryStore, StoreHandles};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service_on(
    instance_id: &str,
    relay: Arc<dyn Relay>,
    dispatcher: Arc<dyn MentionDispatcher>,
) -> Arc<ChatService> {
    let store = Arc::new(InMemoryStore::new());
    let mut config = Config::default();
    config.instance_id = instance_id.to_string();
    ChatService::with_collaborators(
        config,
        StoreHandles {
            messages: store.clone(),
            threads: store,
        },
        Arc::new(InMemoryCache::new()),
        relay,
        dispatcher,
    )
}

fn new_message(id: &str, content: &str) -> ClientEvent {
    ClientEvent::NewMessage {
        id: id.into(),
        chat_id: "c1".into(),
        sender_id: "u1".into(),
        content: content.into(),
        thread_id: None,
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn relay_reaches_sockets_on_the_other_instance_exactly_once() {
    let relay = Arc::new(InProcessRelay::new());
    let a = service_on("inst-a", relay.clone(), Arc::new(NoopMentionDispatcher));
    let b = service_on("inst-b", relay, Arc::new(NoopMentionDispatcher));
    a.start();
    b.start();
    // Let both relay consumers subscribe before anything is published.
    tokio::task::yield_now().await;

    let (conn_a, mut rx_a) = a.register_connection("u1");
    a.handle_event(
        &conn_a,
        ClientEvent::JoinChat {
            chat_id: "c1".into(),
        },
    )
    .await;
    let (conn_b, mut rx_b) = b.register_connection("u2");
    b.handle_event(
        &conn_b,
        ClientEvent::JoinChat {
            chat_id: "c1".into(),
        },
    )
    .await;

    a.handle_event(&conn_a, new_message("m1", "hello across instances"))
        .await;

    // B's socket sees the relayed copy.
    let relayed = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
        .await
        .expect("relayed event")
        .unwrap();
    assert!(matches!(relayed, ServerEvent::NewMessage { .. }));

    // A's socket sees the direct copy and the send ack, and no relay echo.
    tokio::task::yield_now().await;
    let mut new_messages = 0;
    while let Ok(event) = rx_a.try_recv() {
        if matches!(event, ServerEvent::NewMessage { .. }) {
            new_messages += 1;
        }
    }
    assert_eq!(new_messages, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn mention_enrichment_lands_in_broadcast_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "aiContext": {"model": "foodie-v2", "confidence": 0.93}
        })))
        .mount(&server)
        .await;

    let dispatcher =
        Arc::new(HttpMentionDispatcher::new(server.uri(), Duration::from_secs(2)).unwrap());
    let service = service_on("inst-a", Arc::new(InProcessRelay::new()), dispatcher);

    let (conn, mut rx) = service.register_connection("u1");
    service
        .handle_event(
            &conn,
            ClientEvent::JoinChat {
                chat_id: "c1".into(),
            },
        )
        .await;
    service
        .handle_event(&conn, new_message("m1", "@foodie best pasta?"))
        .await;

    let event = rx.try_recv().unwrap();
    let ServerEvent::NewMessage { message } = event else {
        panic!("expected broadcast, got {event:?}");
    };
    assert_eq!(message.metadata.mentions, vec!["foodie"]);
    assert_eq!(
        message.metadata.ai_context.get("model"),
        Some(&serde_json::json!("foodie-v2"))
    );
}

#[tokio::test]
async fn slow_dispatcher_is_cut_off_at_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(10))
                .set_body_json(serde_json::json!({})),
        )
        .mount(&server)
        .await;

    let dispatcher =
        Arc::new(HttpMentionDispatcher::new(server.uri(), Duration::from_millis(200)).unwrap());
    let store = Arc::new(InMemoryStore::new());
    let mut config = Config::default();
    config.mentions.timeout_ms = 200;
    let service = ChatService::with_collaborators(
        config,
        StoreHandles {
            messages: store.clone(),
            threads: store,
        },
        Arc::new(InMemoryCache::new()),
        Arc::new(InProcessRelay::new()),
        dispatcher,
    );

    let (conn, mut rx) = service.register_connection("u1");
    let started = std::time::Instant::now();
    service
        .handle_event(&conn, new_message("m1", "@planner weekend ideas"))
        .await;

    // The send completed well before the collaborator's 10s stall.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        rx.try_recv().unwrap(),
        ServerEvent::MessageSent { .. }
    ));
}
