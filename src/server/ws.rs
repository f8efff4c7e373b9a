// src/server/ws.rs
// Per-connection WebSocket state machine for job progress streaming

use super::AppState;
use crate::progress::store::ProgressSnapshot;
use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-message receive timeout
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(25);
/// Per-message send timeout
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Whole-connection budget
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3600);
/// Outbound broadcast buffer per connection
const OUTBOUND_BUFFER: usize = 64;

const CLOSE_POLICY: u16 = 1008;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL: u16 = 1011;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

enum Exit {
    Disconnect,
    Timeout,
    MessageCap,
    Error,
    Policy(&'static str),
}

/// WebSocket upgrade handler for `/ws/progress/{job_id}`
pub async fn progress_handler(
    Path(job_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let max_message_size = state.context.config.websocket.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, job_id, origin))
}

async fn handle_socket(socket: WebSocket, state: AppState, job_id: String, origin: Option<String>) {
    // Security gate: job id, origin, connection cap. Violations close with
    // 1008 before any application frame is delivered.
    if !state.context.validate_job_id(&job_id).valid {
        reject(socket, "Invalid job ID").await;
        return;
    }
    if !state
        .context
        .config
        .websocket
        .origin_allowed(origin.as_deref())
    {
        warn!(job_id, origin = origin.as_deref().unwrap_or(""), "rejected unauthorized origin");
        reject(socket, "Unauthorized origin").await;
        return;
    }
    let cap = state.context.config.websocket.max_concurrent_connections;
    if state.connection_count.fetch_add(1, Ordering::SeqCst) >= cap {
        state.connection_count.fetch_sub(1, Ordering::SeqCst);
        warn!(job_id, "connection limit reached");
        reject(socket, "Connection limit reached").await;
        return;
    }

    // Register with the job manager; broadcasts arrive on this channel
    let (outbound_tx, outbound_rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);
    let connection = state
        .context
        .job_manager
        .add_connection(&job_id, outbound_tx)
        .await;
    info!(
        job_id,
        connections = state.connection_count.load(Ordering::SeqCst),
        "WebSocket connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let exit = run_connection(&mut ws_tx, &mut ws_rx, &state, &job_id, outbound_rx).await;
    match exit {
        Exit::Disconnect => info!(job_id, "WebSocket disconnected"),
        Exit::Timeout => {
            info!(job_id, "WebSocket connection timeout");
            close_with(&mut ws_tx, CLOSE_GOING_AWAY, "Connection timeout").await;
        }
        Exit::MessageCap => {
            info!(job_id, "WebSocket message cap reached");
            close_with(&mut ws_tx, CLOSE_GOING_AWAY, "Message limit reached").await;
        }
        Exit::Error => {
            close_with(&mut ws_tx, CLOSE_INTERNAL, "Internal error").await;
        }
        Exit::Policy(reason) => {
            close_with(&mut ws_tx, CLOSE_POLICY, reason).await;
        }
    }

    // Cleanup always runs
    state
        .context
        .job_manager
        .remove_connection(&job_id, connection)
        .await;
    state.connection_count.fetch_sub(1, Ordering::SeqCst);
}

async fn run_connection(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    state: &AppState,
    job_id: &str,
    mut outbound_rx: mpsc::Receiver<Value>,
) -> Exit {
    let ws_config = &state.context.config.websocket;

    // Initial frame: the current snapshot, or a synthetic waiting frame
    let initial = state
        .context
        .progress_store
        .read(job_id)
        .ok()
        .flatten()
        .unwrap_or_else(|| ProgressSnapshot::waiting(job_id));
    if send_json(ws_tx, &initial).await.is_err() {
        return Exit::Error;
    }

    let deadline = tokio::time::Instant::now() + CONNECTION_TIMEOUT;
    let mut message_count: usize = 0;
    let mut rate_window = tokio::time::Instant::now();
    let mut rate_count: usize = 0;

    loop {
        if message_count >= ws_config.max_messages_per_connection {
            return Exit::MessageCap;
        }

        tokio::select! {
            maybe_update = outbound_rx.recv() => {
                let Some(update) = maybe_update else {
                    return Exit::Error;
                };
                if send_json(ws_tx, &update).await.is_err() {
                    return Exit::Error;
                }
            }
            inbound = tokio::time::timeout(RECEIVE_TIMEOUT, ws_rx.next()) => {
                match inbound {
                    Err(_) => {
                        debug!(job_id, message_count, "message receive timeout");
                        return Exit::Timeout;
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return Exit::Disconnect,
                    Ok(Some(Err(e))) => {
                        warn!(job_id, "WebSocket message error: {}", e);
                        return Exit::Error;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if text.len() > ws_config.max_message_size {
                            return Exit::Policy("Message too large");
                        }

                        // Optional messages-per-second guard
                        if rate_window.elapsed() >= Duration::from_secs(1) {
                            rate_window = tokio::time::Instant::now();
                            rate_count = 0;
                        }
                        rate_count += 1;
                        if rate_count > ws_config.messages_per_second {
                            return Exit::Policy("Message rate exceeded");
                        }

                        message_count += 1;
                        let echo = serde_json::json!({
                            "type": "echo",
                            "message": format!("Received: {}", text.as_str()),
                            "job_id": job_id,
                            "message_count": message_count,
                        });
                        if send_json(ws_tx, &echo).await.is_err() {
                            return Exit::Error;
                        }
                    }
                    Ok(Some(Ok(_))) => {
                        // Pings and pongs are protocol noise; binary frames
                        // are ignored
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Exit::Timeout;
            }
        }
    }
}

async fn send_json<T: serde::Serialize>(ws_tx: &mut WsSink, value: &T) -> Result<(), ()> {
    let text = serde_json::to_string(value).map_err(|_| ())?;
    match tokio::time::timeout(SEND_TIMEOUT, ws_tx.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

/// Close an unaccepted-for-business socket during the security gate
async fn reject(mut socket: WebSocket, reason: &'static str) {
    let frame = CloseFrame {
        code: CLOSE_POLICY,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn close_with(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
}
