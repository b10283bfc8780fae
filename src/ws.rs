//! Websocket transport: per-connection actor that bridges an axum
//! `WebSocketStream` to the signaling engine.
//!
//! Structurally grounded on this codebase's websocket hub/handler split: the
//! socket is split into send/receive halves, a dedicated task drains an
//! outbound channel into the write half, and the main task loop feeds
//! inbound frames to the engine one at a time.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::SocketId;
use crate::engine::Engine;
use crate::protocol::{InboundMessage, OutboundMessage};

/// What gets queued for delivery to one agent's socket.
pub type WsMessage = OutboundMessage;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(engine): State<Engine>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

async fn handle_socket(socket: WebSocket, engine: Engine) {
    let socket_id = next_socket_id();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(socket_id, error = %e, "failed to serialize outbound message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let parsed: Result<InboundMessage, _> = serde_json::from_str(&text);
                match parsed {
                    Ok(msg) => engine.dispatch(socket_id, &tx, msg).await,
                    Err(e) => {
                        let _ = tx.send(OutboundMessage::err(e.to_string()));
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let _ = tx.send(OutboundMessage::err("binary frames are not supported"));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(socket_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    send_task.abort();
    engine.handle_disconnect(socket_id).await;
}
