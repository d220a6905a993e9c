// =============================================================================
// WebSocket Handler - Push-based snapshot updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. The current FeedSnapshot immediately on connect.
//   2. A fresh snapshot every time the feed publishes a new version.
//
// Slow clients never queue: the `watch` channel only ever holds the latest
// snapshot, so a client that falls behind skips straight to the newest one.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::api::ApiState;
use crate::app_state::FeedSnapshot;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    info!("snapshot socket accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut snapshots = state.feed.subscribe();

    let initial = snapshots.borrow_and_update().clone();
    if let Err(e) = send_snapshot(&mut sender, &initial).await {
        warn!(error = %e, "failed to send initial snapshot");
        return;
    }

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    info!("feed stopped, closing snapshot socket");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if let Err(e) = send_snapshot(&mut sender, &snapshot).await {
                    debug!(error = %e, "snapshot send failed, disconnecting");
                    break;
                }
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sender.send(Message::Pong(data)).await {
                        debug!(error = %e, "failed to send pong, disconnecting");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("snapshot socket closed by client");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "snapshot socket receive error");
                    break;
                }
            },
        }
    }
}

/// Serialize and send one snapshot. Serialization failures are logged and
/// skipped; only transport failures end the connection.
async fn send_snapshot<S>(sender: &mut S, snapshot: &FeedSnapshot) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = snapshot.version, "snapshot pushed");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize snapshot");
            Ok(())
        }
    }
}
