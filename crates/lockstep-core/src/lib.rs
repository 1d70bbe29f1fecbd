//! Event timeline, deterministic replay, and clock synchronization for
//! Lockstep.
//!
//! Participants with unsynchronized clocks agree on one ordered event
//! history per room and derive identical simulated state from it. This
//! crate holds the pieces that make that work and has no I/O of its own.
//!
//! # Modules
//!
//! - [`timeline`] -- Ordered, deduplicating event ledger with insertion
//!   notifications.
//! - [`replay`] -- [`Simulation`] trait and the checkpointing
//!   [`ReplayEngine`] that answers "state at time T".
//! - [`clock_sync`] -- Round-trip clock offset estimation against the
//!   authority's reference clock.
//! - [`session`] -- A timeline and replay engine wired together, with
//!   batch merge for resync.
//!
//! [`Simulation`]: replay::Simulation
//! [`ReplayEngine`]: replay::ReplayEngine

pub mod clock_sync;
pub mod replay;
pub mod session;
pub mod timeline;

pub use clock_sync::{
    ClockEstimate, ClockSync, ClockSyncError, LocalClock, ProbeOutcome, SystemClock,
};
pub use replay::{ReplayEngine, ReplaySnapshot, Simulation};
pub use session::{MergeSummary, Session};
pub use timeline::{InsertOutcome, Insertion, Timeline};
