//! Conversation management endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// `GET /v1/conversations[?user_id=]` — the user-scoped variant computes
/// message counts by subquery; the global variant returns stored rows.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let result = match query.user_id.as_deref() {
        Some(user_id) => state.store.list_conversations_for_user(user_id).await,
        None => state.store.list_conversations().await,
    };
    match result {
        Ok(conversations) => Json(json!({ "conversations": conversations })).into_response(),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub user_id: String,
}

/// `POST /v1/conversations`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> impl IntoResponse {
    let conversation_id = body
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match state
        .store
        .create_conversation(&conversation_id, &body.user_id)
        .await
    {
        Ok(conversation) => (StatusCode::CREATED, Json(conversation)).into_response(),
        Err(e) => storage_error(e),
    }
}

/// `GET /v1/conversations/:id/messages` — full sanitized history.
pub async fn messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.fetch_history(&id, 0).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(e) => storage_error(e),
    }
}

/// `GET /v1/conversations/:id/traces`
pub async fn traces(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.traces.traces_for_conversation(&id).await {
        Ok(traces) => Json(json!({ "traces": traces })).into_response(),
        Err(e) => storage_error(e),
    }
}

/// `DELETE /v1/conversations/:id` — removes the conversation, its
/// messages (cascade), and its traces.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.traces.delete_for_conversation(&id).await {
        return storage_error(e);
    }
    match state.store.delete_conversation(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

/// `POST /v1/conversations/:id/stop` — cancel the running turn.
pub async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.cancels.cancel(&id) {
        Json(json!({ "stopped": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no running turn for conversation" })),
        )
            .into_response()
    }
}

fn storage_error(e: parley_domain::error::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}
