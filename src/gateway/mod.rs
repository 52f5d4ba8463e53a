//! HTTP/WebSocket gateway.
//!
//! `GET /ws?sender=<id>` upgrades into the socket event loop; `/healthz`
//! reports instance id and delivery counters; the two `/messages` routes are
//! the read-through pagination surface.

pub mod ws;

use crate::service::ChatService;
use crate::storage::{Page, DEFAULT_PAGE_LIMIT};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
}

pub fn router(service: Arc<ChatService>) -> Router {
    Router::new()
        .route("/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .route("/chats/{chat_id}/messages", get(chat_messages))
        .route("/threads/{thread_id}/messages", get(thread_messages))
        .with_state(AppState { service })
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

impl PageQuery {
    fn page(&self) -> Page {
        Page::new(
            self.offset.unwrap_or(0),
            self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
    }
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "instance": state.service.instance_id(),
        "delivery": state.service.delivery_stats(),
    }))
}

async fn chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<crate::model::Message>>, (StatusCode, String)> {
    state
        .service
        .pipeline()
        .chat_messages(&chat_id, query.page())
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

async fn thread_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<crate::model::Message>>, (StatusCode, String)> {
    state
        .service
        .pipeline()
        .thread_messages(&thread_id, query.page())
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}
