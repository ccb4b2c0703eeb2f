use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chat_cluster::{ClientEvent, METRICS};
use futures_util::{SinkExt, StreamExt};

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one WebSocket to a client session until either side goes away.
///
/// Text frames are decoded as client events; server events are encoded back
/// as text frames. The session ends (and its username is released) when the
/// socket closes, and the socket is closed when the instance drops the
/// session.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut session = match state.instance.connect() {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Rejecting WebSocket client: {}", e);
            return;
        }
    };
    let connection_id = session.id();
    tracing::debug!(%connection_id, "WebSocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = session.recv() => {
                let Some(event) = event else {
                    // Evicted, or the instance is shutting down
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                let frame = match event.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(%connection_id, "Failed to encode server event: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match ClientEvent::parse(&text) {
                    Ok(event) => {
                        if session.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        METRICS.inc_malformed();
                        tracing::warn!(%connection_id, "Ignoring client frame: {}", e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // axum answers pings itself
                Some(Err(e)) => {
                    tracing::debug!(%connection_id, "WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    tracing::debug!(%connection_id, "WebSocket client disconnected");
}
