//! WebSocket chat handler.
//!
//! One socket = one registered connection: a writer task drains the
//! connection's outbound channel into the socket, while this loop parses
//! inbound frames into [`ClientEvent`]s for the service. Closing the socket
//! (or any read error) is the implicit disconnect event.

use super::AppState;
use crate::events::ClientEvent;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Sender identity for this socket (authentication is an upstream
    /// decorator, out of scope here).
    pub sender: String,
}

/// GET /ws?sender=<id> — WebSocket upgrade into the chat event loop
pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.sender))
}

async fn handle_socket(socket: WebSocket, state: AppState, sender_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (conn, mut outbound) = state.service.register_connection(&sender_id);
    info!(connection = %conn.id, sender = %sender_id, "socket connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => state.service.handle_event(&conn, event).await,
            Err(error) => {
                debug!(connection = %conn.id, %error, "ignoring malformed client event");
            }
        }
    }

    state.service.disconnect(&conn.id).await;
    writer.abort();
    info!(connection = %conn.id, "socket disconnected");
}
