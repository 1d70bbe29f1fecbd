//! Axum router construction.
//!
//! Assembles the `WebSocket` protocol endpoint and the REST routes into a
//! single [`Router`] with CORS and request tracing enabled.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router.
///
/// The router includes:
/// - `GET /` and `GET /ws` -- `WebSocket` protocol endpoint
/// - `GET /health` -- liveness
/// - `GET /api/rooms` -- referenced rooms
/// - `GET /api/rooms/{room_id}/events` -- room timeline
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(handlers::health))
        .route("/api/rooms", get(handlers::list_rooms))
        .route("/api/rooms/{room_id}/events", get(handlers::room_events))
        .fallback(handlers::not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
