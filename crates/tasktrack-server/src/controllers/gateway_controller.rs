//! WebSocket transport for the export gateway.
//!
//! Each socket becomes one gateway connection. Events are forwarded as JSON
//! text frames; text frames from the client are parsed as commands.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tasktrack_export::GatewayCommand;
use tracing::{debug, warn};

/// Creates the gateway router.
pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let gateway = state.exports.gateway();
    let (connection, mut events) = gateway.connect();
    let (mut sink, mut stream) = socket.split();

    let forward_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = event.name(), error = %e, "Dropping unserializable gateway event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                Ok(command) => {
                    // Failures already reached the client as an error event.
                    if let Err(e) = gateway.handle(&connection, command).await {
                        debug!(connection_id = %connection, error = %e, "Gateway command failed");
                    }
                }
                Err(e) => gateway.reject(&connection, format!("invalid command: {}", e)),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    gateway.disconnect(&connection);
    forward_task.abort();
}
