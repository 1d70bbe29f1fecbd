//! Shared type definitions for Lockstep.
//!
//! This crate is the single source of truth for the types that cross
//! crate and process boundaries: room identifiers, timeline events, and
//! the JSON messages exchanged between participants and the authority.
//!
//! # Modules
//!
//! - [`room`] -- Validated hexadecimal room identifier
//! - [`event`] -- Timestamped event stored in a room timeline
//! - [`wire`] -- Tagged JSON messages for the `WebSocket` protocol

pub mod event;
pub mod room;
pub mod wire;

// Re-export all public types at crate root for convenience.
pub use event::TimelineEvent;
pub use room::{RoomId, RoomIdError};
pub use wire::{ClientMessage, PostEnvelope, PostMessage, ServerMessage, StampedMessage};
