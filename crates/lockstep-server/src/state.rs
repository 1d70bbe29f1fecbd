//! Shared application state for the authority server.
//!
//! [`AppState`] is the explicit context handed to every handler: the room
//! registry, the record store and the reference clock. Rooms are created
//! lazily on first reference, hydrated from the store, and live for the
//! rest of the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use lockstep_core::{LocalClock, SystemClock};
use lockstep_types::{PostEnvelope, PostMessage, RoomId};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::room::RoomHub;
use crate::store::EventStore;

/// Default per-room broadcast buffer when none is configured.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Shared state for the Axum application.
///
/// Wrapped in [`Arc`] and injected via Axum's `State` extractor.
pub struct AppState {
    rooms: RwLock<BTreeMap<RoomId, Arc<RoomHub>>>,
    store: Option<EventStore>,
    clock: Arc<dyn LocalClock>,
    broadcast_capacity: usize,
}

impl AppState {
    /// Create state backed by `store` and the system clock.
    pub fn new(store: EventStore, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            store: Some(store),
            clock: Arc::new(SystemClock),
            broadcast_capacity,
        }
    }

    /// Create state with no persistence, for tests and embedding.
    pub fn in_memory() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            store: None,
            clock: Arc::new(SystemClock),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }

    /// Replace the reference clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn LocalClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current reading of the reference clock in milliseconds.
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Return the hub for `room_id`, creating and hydrating it on first
    /// reference.
    ///
    /// A store read failure is logged and the room starts empty.
    pub async fn room(&self, room_id: &RoomId) -> Arc<RoomHub> {
        if let Some(hub) = self.rooms.read().await.get(room_id) {
            return Arc::clone(hub);
        }

        let history = match &self.store {
            Some(store) => store.load(room_id).await.unwrap_or_else(|e| {
                warn!(room_id = %room_id, error = %e, "failed to load room history");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let mut rooms = self.rooms.write().await;
        let hub = rooms.entry(room_id.clone()).or_insert_with(|| {
            info!(room_id = %room_id, restored = history.len(), "room opened");
            Arc::new(RoomHub::hydrate(
                room_id.clone(),
                history,
                self.broadcast_capacity,
            ))
        });
        Arc::clone(hub)
    }

    /// Return the hub for `room_id` only if it was already referenced.
    pub async fn existing_room(&self, room_id: &RoomId) -> Option<Arc<RoomHub>> {
        self.rooms.read().await.get(room_id).map(Arc::clone)
    }

    /// Return the ids of every room referenced so far.
    pub async fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Accept a post: stamp, merge, broadcast, then queue it for storage.
    ///
    /// Returns the stamped envelope, or `None` for a repeat of an already
    /// accepted event. Storage failures are logged; delivery has already
    /// happened by then.
    pub async fn post(&self, room_id: &RoomId, message: PostMessage) -> Option<PostEnvelope> {
        let hub = self.room(room_id).await;
        let envelope = hub.accept(message, self.now_millis()).await?;
        if let Some(store) = &self.store
            && let Err(e) = store.append(&envelope)
        {
            warn!(room_id = %room_id, error = %e, "post not persisted");
        }
        Some(envelope)
    }

    /// Return the history a resync from `since` should receive.
    pub async fn resync(&self, room_id: &RoomId, since: i64) -> Vec<PostEnvelope> {
        self.room(room_id).await.history_since(since).await
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl core::fmt::Debug for AppState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.store)
            .field("broadcast_capacity", &self.broadcast_capacity)
            .finish_non_exhaustive()
    }
}
