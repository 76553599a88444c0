//! HTTP/WebSocket surface

pub mod messages;
pub mod ws;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::session::SessionRegistry;
use crate::storage::DatabaseManager;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every connection
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub bus: EventBus,
    pub config: Arc<AppConfig>,
    pub database: Arc<DatabaseManager>,
}

/// Build the router: the duplex channel plus a health probe
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.database.health_check().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "degraded", "error": e.to_string() })),
        ),
    }
}
