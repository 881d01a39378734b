#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::Outbound;
use super::router::SignalingRouter;
use crate::metrics::ServerMetrics;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client. Messages queued beyond this are
/// stale; fan-out drops them rather than blocking the room.
const CHANNEL_CAPACITY: usize = 64;

/// How long the send task may take to flush after disconnect
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles a single WebSocket connection from accept to cleanup
pub async fn handle_connection(
    socket: WebSocket,
    router: SignalingRouter,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let _conn_guard = metrics.track_connection();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

    let connection_id = router.registry().register(tx.clone());
    let Some(connection) = router.registry().lookup(&connection_id) else {
        warn!("Connection {} vanished right after registration", connection_id);
        return;
    };
    info!("New WebSocket connection: {}", connection_id);

    let send_id = connection_id.clone();
    let send_metrics = metrics.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let frame = match item {
                Outbound::Text(json) => {
                    send_metrics.message_sent();
                    Message::Text((*json).clone().into())
                }
                Outbound::Ping => Message::Ping(Default::default()),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task finished for connection: {}", send_id);
    });

    loop {
        tokio::select! {
            _ = connection.terminate.notified() => {
                info!("Connection {} terminated by the server", connection_id);
                break;
            }
            frame = ws_receiver.next() => {
                let msg = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("WebSocket error on {}: {}", connection_id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        router.handle_text(&connection_id, text.as_str()).await;
                    }
                    Message::Binary(_) => router.handle_binary(&connection_id),
                    Message::Ping(_) | Message::Pong(_) => {
                        router.registry().mark_alive(&connection_id);
                    }
                    Message::Close(_) => {
                        info!("Client {} closed connection", connection_id);
                        break;
                    }
                }
            }
        }
    }

    // leave the room, release resources, forget the connection
    router.disconnect(&connection_id).await;

    drop(connection);
    drop(tx);
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        warn!("Send task for {} did not finish, aborting", connection_id);
        send_task.abort();
    }

    info!("Connection handler finished for: {}", connection_id);
}
