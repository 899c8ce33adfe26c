//! Chat endpoints — single-shot and chunked streaming.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use parley_agent::traits::ChatRequest;
use parley_domain::error::Error;

use crate::runtime::{ChunkedWriter, TurnParams};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    /// Conversation to continue; a fresh id is minted when absent.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub request: ChatRequest,
}

fn turn_params(body: &ChatBody) -> TurnParams {
    TurnParams {
        conversation_id: body
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        user_id: body.user_id.clone(),
        session_id: uuid::Uuid::new_v4().to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chat (single-shot)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    let params = turn_params(&body);
    let cancel = state.cancels.register(&params.conversation_id);

    let result = state
        .runtime
        .run_single_shot(&params, body.request, &cancel)
        .await;
    state.cancels.remove(&params.conversation_id);

    match result {
        Ok(response) => Json(json!({
            "conversation_id": params.conversation_id,
            "parts": response.parts,
            "text": response.text(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Cancelled(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chat/stream (chunked NDJSON)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streams the same frames the persistent connection carries, one JSON
/// object per line, flushed after every frame. Client disconnect closes
/// the body channel, which stops the running turn.
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    let params = turn_params(&body);
    let cancel = state.cancels.register(&params.conversation_id);

    let (tx, mut rx) = mpsc::channel::<String>(32);
    let request = body.request;
    let state_ref = state.clone();
    let task_params = params.clone();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut writer = ChunkedWriter::new(&task_params.session_id, tx);
        let result = state_ref
            .runtime
            .run_streaming(&task_params, request, &task_cancel, &mut writer)
            .await;
        state_ref.cancels.remove(&task_params.conversation_id);

        match result {
            Ok(_) => {}
            Err(e) if e.is_fatal_to_session() => {
                // The peer is gone; cancel so the loop stops issuing
                // agent calls at the next check.
                task_cancel.cancel();
                tracing::info!(
                    conversation_id = %task_params.conversation_id,
                    "client disconnected mid-stream"
                );
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %task_params.conversation_id,
                    error = %e,
                    "streaming turn failed"
                );
            }
        }
    });

    let body_stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(chunk);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .expect("static response parts")
}
