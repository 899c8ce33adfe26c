//! Persistent-connection endpoint.
//!
//! Flow:
//! 1. Client connects to `/v1/ws?conversation_id=...&user_id=...`
//! 2. Each inbound text frame is either the reply to an in-flight
//!    frontend tool (a waiter is parked) or a `{user_message?,
//!    tool_results?}` request that starts a turn
//! 3. All outbound frames flow through one channel drained by the writer
//!    task, so the loop and the frontend bridge never interleave writes
//! 4. Disconnect cancels the running turn and fails any parked waiter;
//!    state already persisted stays persisted

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use parley_agent::traits::ChatRequest;
use parley_domain::error::Error;

use crate::runtime::{SocketWriter, TurnParams};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query params
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let conversation_id = query
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound channel: the loop, the frontend bridge, and this handler
    // all send frames here; the writer task owns the wire.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(64);
    state.connections.register(&session_id, outbound_tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sink
                .send(Message::Text(frame.to_string()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    tracing::info!(
        session_id = %session_id,
        conversation_id = %conversation_id,
        "client connected"
    );

    let mut turn_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                // A parked waiter gets the next client frame, verbatim.
                if state.connections.has_waiter(&session_id) {
                    let value = serde_json::from_str(&text)
                        .unwrap_or_else(|_| Value::String(text.clone()));
                    state.connections.deliver(&session_id, value);
                    continue;
                }

                let request: ChatRequest = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = outbound_tx
                            .send(json!({ "error": format!("invalid request: {e}") }))
                            .await;
                        continue;
                    }
                };

                if turn_task.as_ref().is_some_and(|t| !t.is_finished()) {
                    let _ = outbound_tx
                        .send(json!({ "error": "a turn is already in progress" }))
                        .await;
                    continue;
                }

                turn_task = Some(spawn_turn(
                    &state,
                    &conversation_id,
                    query.user_id.clone(),
                    &session_id,
                    request,
                    outbound_tx.clone(),
                ));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }

    // Disconnect: stop the running turn, fail any parked waiter, and
    // tear down the writer.
    state.cancels.cancel(&conversation_id);
    state.connections.remove(&session_id);
    if let Some(task) = &turn_task {
        // Give the loop a moment to observe the token; it exits at the
        // next suspension point either way.
        if !task.is_finished() {
            tracing::debug!(session_id = %session_id, "turn still unwinding at disconnect");
        }
    }
    writer_task.abort();
    tracing::info!(session_id = %session_id, "client disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn spawn_turn(
    state: &AppState,
    conversation_id: &str,
    user_id: Option<String>,
    session_id: &str,
    request: ChatRequest,
    outbound: mpsc::Sender<Value>,
) -> tokio::task::JoinHandle<()> {
    let params = TurnParams {
        conversation_id: conversation_id.to_owned(),
        user_id,
        session_id: session_id.to_owned(),
    };
    let cancel = state.cancels.register(conversation_id);
    let runtime = state.runtime.clone();
    let cancels = state.cancels.clone();

    tokio::spawn(async move {
        let mut writer = SocketWriter::new(&params.session_id, outbound);
        let result = runtime
            .run_streaming(&params, request, &cancel, &mut writer)
            .await;
        cancels.remove(&params.conversation_id);

        match result {
            Ok(_) => {}
            Err(Error::Cancelled(reason)) => {
                tracing::info!(
                    conversation_id = %params.conversation_id,
                    %reason,
                    "turn cancelled"
                );
            }
            Err(e) if e.is_fatal_to_session() => {
                tracing::warn!(
                    conversation_id = %params.conversation_id,
                    error = %e,
                    "session writer failed; connection teardown will follow"
                );
            }
            Err(e) => {
                // Non-fatal: the loop already emitted the error frame.
                tracing::warn!(
                    conversation_id = %params.conversation_id,
                    error = %e,
                    "turn failed"
                );
            }
        }
    })
}
