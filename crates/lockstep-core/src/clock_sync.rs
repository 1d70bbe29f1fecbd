//! Clock offset estimation against the authority's reference clock.
//!
//! Participants stamp events with `local_time + offset` so timestamps from
//! different machines are comparable. The offset is estimated by probing:
//!
//! ```text
//! Participant                     Authority
//!   |--- get time (sent_at) ------->|
//!   |<-- inform time (server_time) -|   (received_at)
//!
//!   round_trip = received_at - sent_at
//!   offset     = server_time - (sent_at + round_trip / 2)
//! ```
//!
//! The midpoint assumes symmetric latency, so the probe with the smallest
//! round trip carries the least error. [`ClockSync`] keeps only that best
//! estimate; a worse probe never replaces it.

use chrono::Utc;
use tracing::debug;

/// Errors produced while processing a probe reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockSyncError {
    /// The reply was observed before the probe was sent.
    #[error("negative round trip: sent at {sent_at}, received at {received_at}")]
    NegativeRoundTrip {
        /// Local send time of the probe.
        sent_at: i64,
        /// Local receive time of the reply.
        received_at: i64,
    },

    /// A reply arrived with no probe outstanding to match it against.
    #[error("reply received with no outstanding probe")]
    NoOutstandingProbe,

    /// The offset computation overflowed.
    #[error("clock offset arithmetic overflow")]
    Overflow,
}

/// Source of local wall-clock time in milliseconds.
pub trait LocalClock: Send + Sync {
    /// Current local time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// One offset estimate derived from a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEstimate {
    /// Round-trip time of the probe in milliseconds.
    pub round_trip_time: i64,
    /// `reference_time - local_time` at the probe midpoint.
    pub offset: i64,
}

impl ClockEstimate {
    /// Derive an estimate from one completed probe.
    ///
    /// # Errors
    ///
    /// Returns [`ClockSyncError::NegativeRoundTrip`] if `received_at` is
    /// earlier than `sent_at`, or [`ClockSyncError::Overflow`] if the
    /// timestamps are too far apart to subtract.
    pub fn from_probe(
        sent_at: i64,
        server_time: i64,
        received_at: i64,
    ) -> Result<Self, ClockSyncError> {
        let round_trip_time = received_at
            .checked_sub(sent_at)
            .ok_or(ClockSyncError::Overflow)?;
        if round_trip_time < 0 {
            return Err(ClockSyncError::NegativeRoundTrip {
                sent_at,
                received_at,
            });
        }
        let midpoint = sent_at
            .checked_add(round_trip_time.div_euclid(2))
            .ok_or(ClockSyncError::Overflow)?;
        let offset = server_time
            .checked_sub(midpoint)
            .ok_or(ClockSyncError::Overflow)?;
        Ok(Self {
            round_trip_time,
            offset,
        })
    }
}

/// Result of feeding one probe reply into [`ClockSync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// The estimate derived from this probe alone.
    pub sample: ClockEstimate,
    /// Whether it replaced the retained estimate.
    pub improved: bool,
}

/// Best-so-far clock offset tracker for one synchronization session.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    /// Lowest round-trip estimate seen.
    best: Option<ClockEstimate>,
    /// Send time of the most recent probe not yet answered.
    outstanding: Option<i64>,
    /// Number of replies processed.
    samples: u64,
}

impl ClockSync {
    /// Create a tracker with no estimate.
    pub const fn new() -> Self {
        Self {
            best: None,
            outstanding: None,
            samples: 0,
        }
    }

    /// Record that a probe is being sent at local time `sent_at`.
    ///
    /// Returns the value to put in the probe's `client_time` field.
    pub const fn begin_probe(&mut self, sent_at: i64) -> i64 {
        self.outstanding = Some(sent_at);
        sent_at
    }

    /// Process a reply to the outstanding probe.
    ///
    /// `echoed` is the `client_time` the authority echoed back, if any; it
    /// takes precedence over the locally remembered send time.
    ///
    /// # Errors
    ///
    /// Returns [`ClockSyncError::NoOutstandingProbe`] if neither an echoed
    /// nor a remembered send time is available, or any error of
    /// [`ClockSync::observe`].
    pub fn complete_probe(
        &mut self,
        echoed: Option<i64>,
        server_time: i64,
        received_at: i64,
    ) -> Result<ProbeOutcome, ClockSyncError> {
        let sent_at = echoed
            .or(self.outstanding)
            .ok_or(ClockSyncError::NoOutstandingProbe)?;
        if self.outstanding == Some(sent_at) {
            self.outstanding = None;
        }
        self.observe(sent_at, server_time, received_at)
    }

    /// Fold one completed probe into the tracker.
    ///
    /// The retained estimate changes only if this probe's round trip is
    /// strictly shorter than the best seen so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe timestamps are inconsistent; the
    /// retained estimate is left untouched.
    pub fn observe(
        &mut self,
        sent_at: i64,
        server_time: i64,
        received_at: i64,
    ) -> Result<ProbeOutcome, ClockSyncError> {
        let sample = ClockEstimate::from_probe(sent_at, server_time, received_at)?;
        self.samples = self.samples.saturating_add(1);

        let improved = self
            .best
            .is_none_or(|best| sample.round_trip_time < best.round_trip_time);
        if improved {
            debug!(
                round_trip_ms = sample.round_trip_time,
                offset_ms = sample.offset,
                "clock estimate improved"
            );
            self.best = Some(sample);
        }
        Ok(ProbeOutcome { sample, improved })
    }

    /// Return the retained estimate, if any probe has completed.
    pub const fn estimate(&self) -> Option<ClockEstimate> {
        self.best
    }

    /// Return the retained offset, if any.
    pub fn offset(&self) -> Option<i64> {
        self.best.map(|b| b.offset)
    }

    /// Return the number of replies processed.
    pub const fn samples(&self) -> u64 {
        self.samples
    }

    /// Convert a local time to the reference timeline.
    ///
    /// Falls back to `local_time` unchanged when no estimate exists.
    pub fn to_reference(&self, local_time: i64) -> i64 {
        self.offset()
            .map_or(local_time, |offset| local_time.saturating_add(offset))
    }

    /// Read `clock` and convert the reading to the reference timeline.
    pub fn reference_now(&self, clock: &dyn LocalClock) -> i64 {
        self.to_reference(clock.now_millis())
    }
}
