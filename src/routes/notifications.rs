//! Live push notifications over a WebSocket.
//!
//! `GET /ws` upgrades the connection and streams every [`Notification`] as a
//! JSON text frame, optionally narrowed to one zone with `?zone_id=`. A
//! session that falls behind skips what it missed and carries on.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::AppState;
use crate::events::Notification;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    zone_id: Option<String>,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(telemetry): State<AppState>,
    Query(params): Query<SubscribeQuery>,
) -> Response {
    // ---
    let rx = telemetry.notifier().subscribe();
    ws.on_upgrade(move |socket| session(socket, rx, params.zone_id))
}

async fn session(
    mut socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<Notification>,
    zone_id: Option<String>,
) {
    // ---
    debug!(zone_id = ?zone_id, "Notification session opened");
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(notification) => {
                    if zone_id.as_deref().is_some_and(|z| z != notification.zone_id()) {
                        continue;
                    }
                    let text = match serde_json::to_string(&notification) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode notification: {}", e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Notification session lagging");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Notification session closed");
}
