//! Timeline events.
//!
//! A [`TimelineEvent`] is the unit stored in a room timeline: an opaque
//! JSON payload, the participant-assigned (clock-corrected) time, and the
//! authority's arrival stamp. An event posted locally but not yet echoed
//! back by the authority has no arrival stamp, which orders it after every
//! confirmed copy of the same event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A timestamped event in a room timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Opaque payload supplied by the producer.
    pub data: Value,
    /// Logical time in milliseconds on the authority's clock.
    pub time: i64,
    /// Authority arrival time in milliseconds, or `None` while the event
    /// is an unconfirmed local entry (treated as +infinity).
    #[serde(
        rename = "server_received_at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub received_at: Option<i64>,
}

impl TimelineEvent {
    /// Create an event confirmed by the authority at `received_at`.
    pub const fn confirmed(data: Value, time: i64, received_at: i64) -> Self {
        Self {
            data,
            time,
            received_at: Some(received_at),
        }
    }

    /// Create a local, not-yet-confirmed event.
    pub const fn unconfirmed(data: Value, time: i64) -> Self {
        Self {
            data,
            time,
            received_at: None,
        }
    }

    /// Two events are equivalent when their times and payloads are equal.
    ///
    /// Payload equality is structural: objects compare by key/value, not by
    /// field order or identity.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.time == other.time && self.data == other.data
    }

    /// Whether `self` should replace an equivalent `existing` entry.
    ///
    /// Only a finite arrival stamp strictly earlier than the stored one
    /// wins; ties keep the existing entry.
    pub fn supersedes(&self, existing: &Self) -> bool {
        match (self.received_at, existing.received_at) {
            (Some(new), Some(old)) => new < old,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}
