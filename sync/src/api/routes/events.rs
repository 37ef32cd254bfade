//! WebSocket feed of Event Bus events.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::{AppState, ConnectionManager};
use crate::events::Event;

pub fn routes() -> Router<AppState> {
    Router::new().route("/events", get(events_handler))
}

/// GET /events - upgrade to a WebSocket that streams events as JSON text.
async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state.connections))
}

async fn handle_connection(socket: WebSocket, connections: Arc<ConnectionManager>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let conn_id = connections.register(tx);

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize event: {}", e);
                }
            }
        }
    });

    // The feed is one-way; incoming frames only matter for closing.
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    connections.unregister(&conn_id);
    send_task.abort();
}
