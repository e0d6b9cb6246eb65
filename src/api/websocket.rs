//! WebSocket endpoint for device sessions

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};

use super::ApiState;
use crate::gateway::Gateway;

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

/// Drive one device connection until either side goes away
async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();
    let (mut session, mut rx) = gateway.open_session();
    let session_id = session.id();

    tracing::debug!(session = %session_id, "WebSocket connected");

    // Forward queued frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg.to_text() {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode outbound frame"),
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Err(e) = session.handle_text(&text).await {
                        tracing::warn!(session = %session_id, error = %e, "session handler failed");
                        break;
                    }
                }
                Ok(Message::Binary(data)) => {
                    tracing::debug!(session = %session_id, len = data.len(), "ignoring binary frame");
                }
                Ok(Message::Close(_)) => {
                    tracing::debug!(session = %session_id, "WebSocket closed by client");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(session = %session_id, error = %e, "WebSocket transport error");
                    break;
                }
            }
        }
        session.close().await;
    });

    // Wait for either task to complete. Aborting the receive task cannot cut
    // cleanup short: it runs on its own task, spawned by `close` or by the
    // session's `Drop`
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::debug!(session = %session_id, "WebSocket disconnected");
}
