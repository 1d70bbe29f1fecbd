//! A room timeline paired with its replay engine.
//!
//! [`Session`] is what a participant holds per watched room. Every
//! insertion goes through it so the engine always learns where history
//! changed before the next state query.

use lockstep_types::TimelineEvent;
use tokio::sync::broadcast;
use tracing::debug;

use crate::replay::{ReplayEngine, Simulation};
use crate::timeline::{InsertOutcome, Insertion, Timeline};

/// Counts from one [`Session::merge`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Events added to the timeline.
    pub inserted: usize,
    /// Stored entries replaced by an earlier confirmation.
    pub replaced: usize,
    /// Events that were already present.
    pub duplicates: usize,
    /// Lowest index a genuine insertion landed at, if any.
    pub earliest_index: Option<usize>,
}

/// Timeline and replay engine for one room.
#[derive(Debug)]
pub struct Session<S: Simulation> {
    timeline: Timeline,
    engine: ReplayEngine<S>,
}

impl<S: Simulation> Session<S> {
    /// Create a session with an empty timeline.
    pub fn new(engine: ReplayEngine<S>) -> Self {
        Self {
            timeline: Timeline::new(),
            engine,
        }
    }

    /// Insert one event and report it to the engine.
    pub fn insert(&mut self, event: TimelineEvent) -> InsertOutcome {
        let outcome = self.timeline.insert(event);
        if outcome.inserted {
            self.engine.note_insertion(outcome.index);
        }
        outcome
    }

    /// Insert a batch, such as a resync answer, in any order.
    ///
    /// Indices shift as the batch goes in, so the engine is told once,
    /// afterwards, about the lowest index touched.
    pub fn merge<I>(&mut self, events: I) -> MergeSummary
    where
        I: IntoIterator<Item = TimelineEvent>,
    {
        let mut summary = MergeSummary::default();
        for event in events {
            let outcome = self.timeline.insert(event);
            if outcome.inserted {
                summary.inserted = summary.inserted.saturating_add(1);
                summary.earliest_index = Some(
                    summary
                        .earliest_index
                        .map_or(outcome.index, |i| i.min(outcome.index)),
                );
            } else if outcome.replaced {
                summary.replaced = summary.replaced.saturating_add(1);
            } else {
                summary.duplicates = summary.duplicates.saturating_add(1);
            }
        }
        if let Some(index) = summary.earliest_index {
            self.engine.note_insertion(index);
        }
        debug!(
            inserted = summary.inserted,
            replaced = summary.replaced,
            duplicates = summary.duplicates,
            "merged event batch"
        );
        summary
    }

    /// Compute the simulated state at `target_time`.
    pub fn state_at(&mut self, target_time: i64) -> S::State {
        self.engine.state_at(&self.timeline, target_time)
    }

    /// Return the resync watermark of the timeline.
    pub fn watermark(&self) -> i64 {
        self.timeline.watermark()
    }

    /// Borrow the timeline.
    pub const fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Borrow the replay engine.
    pub const fn engine(&self) -> &ReplayEngine<S> {
        &self.engine
    }

    /// Subscribe to the timeline's insertion notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Insertion> {
        self.timeline.subscribe()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Counts `(events seen, ticks seen)`.
    #[derive(Debug, Clone, Copy)]
    struct Counter;

    impl Simulation for Counter {
        type State = (i64, i64);

        fn apply(&self, state: (i64, i64), _event: &TimelineEvent) -> (i64, i64) {
            (state.0 + 1, state.1)
        }

        fn tick(&self, state: (i64, i64)) -> (i64, i64) {
            (state.0, state.1 + 1)
        }
    }

    fn session() -> Session<Counter> {
        Session::new(ReplayEngine::new(Counter, (0, 0), 1))
    }

    fn confirmed(data: &str, time: i64, received_at: i64) -> TimelineEvent {
        TimelineEvent::confirmed(json!(data), time, received_at)
    }

    #[test]
    fn insert_reports_to_engine() {
        let mut session = session();
        session.insert(confirmed("a", 0, 1));
        session.insert(confirmed("b", 2_000, 2_001));
        assert_eq!(session.state_at(3_000), (2, 3));

        session.insert(confirmed("c", 1_000, 3_500));
        assert_eq!(session.engine().invalidated_from(), Some(1));
        assert_eq!(session.state_at(3_000), (3, 3));
    }

    #[test]
    fn merge_counts_and_invalidates_once() {
        let mut session = session();
        session.insert(TimelineEvent::unconfirmed(json!("a"), 0));
        session.insert(confirmed("d", 3_000, 3_010));
        session.state_at(4_000);

        let summary = session.merge([
            confirmed("a", 0, 5),
            confirmed("c", 2_000, 2_010),
            confirmed("b", 1_000, 1_010),
            confirmed("d", 3_000, 3_010),
        ]);
        assert_eq!(
            summary,
            MergeSummary {
                inserted: 2,
                replaced: 1,
                duplicates: 1,
                earliest_index: Some(1),
            }
        );
        assert_eq!(session.timeline().len(), 4);
        assert_eq!(session.state_at(4_000), (4, 4));
        assert_eq!(session.watermark(), 3_010);
    }

    #[test]
    fn resync_after_gap_converges_with_uninterrupted_watcher() {
        let history = [
            confirmed("a", 0, 10),
            confirmed("b", 1_000, 1_010),
            confirmed("c", 2_000, 2_010),
            confirmed("d", 3_000, 3_010),
        ];

        let mut steady = session();
        for e in &history {
            steady.insert(e.clone());
        }

        // Missed "b" and "c" while disconnected, then resynced from the
        // watermark plus a full backfill that repeats what it already has.
        let mut gapped = session();
        gapped.insert(history[0].clone());
        gapped.state_at(500);
        gapped.insert(history[3].clone());
        gapped.state_at(3_500);
        let since = gapped.watermark();
        assert_eq!(since, 3_010);
        gapped.merge(history.iter().cloned());

        assert_eq!(gapped.state_at(3_500), steady.state_at(3_500));
        assert_eq!(gapped.timeline().events(), steady.timeline().events());
    }

    #[test]
    fn subscribers_see_merged_insertions() {
        let mut session = session();
        let mut rx = session.subscribe();
        session.merge([confirmed("x", 5, 6), confirmed("x", 5, 6)]);
        assert_eq!(rx.try_recv().unwrap().index, 0);
        assert!(rx.try_recv().is_err());
    }
}
