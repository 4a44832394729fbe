//! WebSocket transport for the signaling protocol.
//!
//! One connection is one session. Each connection runs three loops:
//! the reader decodes frames and dispatches them to the session, the
//! responder answers them in arrival order, and the writer serializes
//! responses and notifications onto the socket.

use super::protocol::{decode_request, DecodeError, ServerFrame};
use crate::actors::{SessionCoordinator, SessionHandle, SessionResult};
use crate::bus::Notification;
use crate::errors::CoordinatorError;
use crate::observability::metrics::record_signaling_request;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Outbound frame buffer per connection.
const OUTBOUND_BUFFER: usize = 128;

/// Notifications buffered between the session actor and the writer.
const CLIENT_NOTIFICATION_BUFFER: usize = 32;

/// Requests dispatched but not yet answered, per connection.
const PENDING_BUFFER: usize = 64;

/// How long the connection tasks may take to flush after the client goes away.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Build the signaling router (`GET /signaling`).
pub fn signaling_router(coordinator: SessionCoordinator) -> Router {
    Router::new()
        .route("/signaling", get(signaling_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn signaling_handler(
    ws: WebSocketUpgrade,
    State(coordinator): State<SessionCoordinator>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator))
}

/// Serve one signaling connection until the client leaves.
pub async fn handle_socket(mut socket: WebSocket, coordinator: SessionCoordinator) {
    let (notify_tx, notify_rx) = mpsc::channel(CLIENT_NOTIFICATION_BUFFER);

    let handle = match coordinator.connect(notify_tx).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(
                target: "rc.signaling",
                code = e.code(),
                "Rejecting signaling connection"
            );
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = handle.session_id();
    info!(target: "rc.signaling", session_id = %session_id, "Signaling connection opened");

    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (pending_tx, pending_rx) = mpsc::channel(PENDING_BUFFER);

    let writer = tokio::spawn(write_frames(ws_tx, out_rx, notify_rx));
    let responder = tokio::spawn(respond_in_order(pending_rx, out_tx.clone()));

    read_frames(ws_rx, &handle, &pending_tx).await;

    if let Err(e) = coordinator.disconnect(session_id).await {
        warn!(
            target: "rc.signaling",
            session_id = %session_id,
            error = %e,
            "Failed to disconnect session"
        );
    }

    drop(pending_tx);
    drop(out_tx);
    // Flush what is left; a stuck client socket must not hold the task
    for task in [responder, writer] {
        let abort = task.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
            abort.abort();
            debug!(
                target: "rc.signaling",
                session_id = %session_id,
                "Connection task did not drain in time"
            );
        }
    }

    info!(target: "rc.signaling", session_id = %session_id, "Signaling connection closed");
}

/// Queue an answer that is already known behind the pending responses.
async fn answer_now(
    pending_tx: &mpsc::Sender<(u64, oneshot::Receiver<SessionResult>)>,
    id: u64,
    result: SessionResult,
) -> bool {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    pending_tx.send((id, rx)).await.is_ok()
}

async fn read_frames(
    mut ws_rx: SplitStream<WebSocket>,
    handle: &SessionHandle,
    pending_tx: &mpsc::Sender<(u64, oneshot::Receiver<SessionResult>)>,
) {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            // Pings are answered by the socket itself
            Ok(_) => continue,
            Err(e) => {
                debug!(
                    target: "rc.signaling",
                    session_id = %handle.session_id(),
                    error = %e,
                    "WebSocket read failed"
                );
                break;
            }
        };

        match decode_request(&text) {
            Ok((id, request)) => match handle.dispatch(request).await {
                Ok(rx) => {
                    if pending_tx.send((id, rx)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    answer_now(pending_tx, id, Err(e)).await;
                    break;
                }
            },
            Err(DecodeError::Invalid { id, error }) => {
                record_signaling_request("invalid", error.code(), Duration::ZERO);
                if !answer_now(pending_tx, id, Err(error)).await {
                    break;
                }
            }
            Err(e @ DecodeError::Unidentified(_)) => {
                debug!(
                    target: "rc.signaling",
                    session_id = %handle.session_id(),
                    error = %e,
                    "Dropping unidentified frame"
                );
            }
        }
    }
}

async fn respond_in_order(
    mut pending_rx: mpsc::Receiver<(u64, oneshot::Receiver<SessionResult>)>,
    out_tx: mpsc::Sender<ServerFrame>,
) {
    while let Some((id, rx)) = pending_rx.recv().await {
        let result = rx.await.unwrap_or_else(|e| {
            Err(CoordinatorError::Internal(format!(
                "response receive failed: {e}"
            )))
        });
        if out_tx.send(ServerFrame::response(id, result)).await.is_err() {
            break;
        }
    }
}

async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerFrame>,
    mut notify_rx: mpsc::Receiver<Notification>,
) {
    loop {
        let frame = tokio::select! {
            Some(frame) = out_rx.recv() => frame,
            Some(notification) = notify_rx.recv() => ServerFrame::notification(&notification),
            else => break,
        };

        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "rc.signaling", error = %e, "Failed to encode frame");
                continue;
            }
        };
        if ws_tx.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}
