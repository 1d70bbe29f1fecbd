//! REST API endpoint handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and number of open rooms |
//! | `GET` | `/api/rooms` | Ids of rooms referenced this process |
//! | `GET` | `/api/rooms/{room_id}/events` | Room timeline, optionally `?since=` |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::Uri;
use lockstep_types::{RoomId, TimelineEvent};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

/// Response body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    /// Always `"ok"` while the server runs.
    pub status: String,
    /// Number of rooms referenced so far.
    pub rooms: usize,
}

/// Query parameters for `GET /api/rooms/{room_id}/events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only return events matching a resync from this bound.
    pub since: Option<i64>,
}

/// Report liveness.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: String::from("ok"),
        rooms: state.room_ids().await.len(),
    })
}

/// List the rooms referenced so far.
pub async fn list_rooms(State(state): State<Arc<AppState>>) -> Json<Vec<RoomId>> {
    Json(state.room_ids().await)
}

/// Return a room's timeline in order.
///
/// # Errors
///
/// Returns [`ApiError::InvalidRoomId`] if the path segment is not a hex
/// room id.
pub async fn room_events(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<TimelineEvent>>, ApiError> {
    let room_id = RoomId::parse(&raw)?;
    let hub = state.room(&room_id).await;
    let mut events = hub.events().await;
    if let Some(since) = query.since {
        events.retain(|e| e.time >= since || e.received_at.is_some_and(|r| r >= since));
    }
    Ok(Json(events))
}

/// Fallback for unknown routes.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_owned())
}
