//! HTTP/WebSocket surface.
//!
//! - `POST /v1/chat`          — single-shot turn, full response
//! - `POST /v1/chat/stream`   — chunked NDJSON stream of frames
//! - `GET  /v1/ws`            — persistent connection
//! - `/v1/conversations/...`  — conversation management
//! - `GET  /healthz`          — liveness

pub mod chat;
pub mod conversations;
pub mod ws;

use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat", post(chat::chat))
        .route("/v1/chat/stream", post(chat::chat_stream))
        .route("/v1/ws", get(ws::session_ws))
        .route(
            "/v1/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route(
            "/v1/conversations/:id",
            delete(conversations::delete_conversation),
        )
        .route(
            "/v1/conversations/:id/messages",
            get(conversations::messages),
        )
        .route("/v1/conversations/:id/traces", get(conversations::traces))
        .route("/v1/conversations/:id/stop", post(conversations::stop))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
