//! Authority server for Lockstep rooms.
//!
//! This crate provides an Axum HTTP server that exposes:
//!
//! - **`WebSocket` endpoint** (`/` and `/ws`) speaking the JSON room
//!   protocol: clock probes, watch/unwatch, posts and resync
//! - **REST endpoints** for inspecting rooms and their timelines
//!
//! # Architecture
//!
//! Every room is a [`RoomHub`] holding the room's timeline and a
//! broadcast channel. Posts are stamped with the server clock, merged
//! into the timeline (repeats are absorbed), broadcast to watchers and
//! then queued for the append-only [`EventStore`]. Persistence never
//! delays delivery. Rooms are created on first reference and restored
//! from the store.
//!
//! [`RoomHub`]: room::RoomHub
//! [`EventStore`]: store::EventStore

pub mod config;
pub mod error;
pub mod handlers;
pub mod room;
pub mod router;
pub mod server;
pub mod state;
pub mod store;
pub mod ws;

pub use config::{ConfigError, ServerConfig};
pub use router::build_router;
pub use server::{ServerError, shutdown_signal, start_server};
pub use state::AppState;
