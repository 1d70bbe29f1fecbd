//! Deterministic replay of a timeline into simulated state.
//!
//! A [`ReplayEngine`] answers "what is the state at time T?" for one
//! room. It folds timeline events through [`Simulation::apply`] in
//! timeline order and interleaves fixed-rate [`Simulation::tick`] calls
//! between them.
//!
//! # Tick Grid
//!
//! Ticks fall on a fixed grid anchored at the replay origin, which is the
//! first event's time (never earlier than 0). The number of ticks between
//! `t0 < t1` is `floor((t1 - origin) * tps / 1000) - floor((t0 - origin) *
//! tps / 1000)`, so the total never depends on where a replay was resumed.
//! A non-positive `ticks_per_second` disables ticking.
//!
//! # Checkpoints
//!
//! Every query leaves a [`ReplaySnapshot`] behind: the latest one is the
//! frontier, and a bounded history of older ones is kept as checkpoints.
//! A later query resumes from the newest snapshot that is still valid
//! instead of replaying from the start. A snapshot `(k, t)` stays valid
//! while the first `k` events are unchanged and the event now at index
//! `k` (if any) is later than `t`. Insertions upstream of cached progress
//! are reported through [`ReplayEngine::note_insertion`].
//!
//! # Determinism
//!
//! Checkpoint reuse is sound only because [`Simulation`] implementations
//! are pure: the same state and event always produce the same result.

use std::collections::VecDeque;

use lockstep_types::TimelineEvent;
use tracing::{debug, trace};

use crate::timeline::Timeline;

/// Default number of checkpoints retained per engine.
pub const DEFAULT_CHECKPOINT_CAPACITY: usize = 20;

/// Milliseconds per second, the unit of every timeline timestamp.
const MILLIS_PER_SECOND: i128 = 1000;

/// Pure event and tick logic for one kind of simulated world.
///
/// Implementations must be deterministic: no hidden mutable state, no
/// randomness, no clock reads.
pub trait Simulation {
    /// The simulated state. Stored snapshots hold their own copy.
    type State: Clone + PartialEq + core::fmt::Debug;

    /// Fold one event into the state.
    fn apply(&self, state: Self::State, event: &TimelineEvent) -> Self::State;

    /// Advance the state by one fixed time step.
    fn tick(&self, state: Self::State) -> Self::State;
}

/// A cached replay result.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySnapshot<T> {
    /// Number of timeline events folded in.
    pub event_index: usize,
    /// Time the snapshot was computed for.
    pub query_time: i64,
    /// Simulated state at `query_time`.
    pub state: T,
    /// Time up to which ticks have been accounted for.
    pub last_tick_time: i64,
    /// Tick grid origin the snapshot was computed against.
    pub origin: i64,
}

/// Checkpointing replay engine for one room timeline.
#[derive(Debug)]
pub struct ReplayEngine<S: Simulation> {
    /// Event and tick logic.
    simulation: S,
    /// State before any event.
    initial: S::State,
    /// Tick rate; non-positive disables ticking.
    ticks_per_second: i64,
    /// Most recent query result.
    frontier: Option<ReplaySnapshot<S::State>>,
    /// Older results, oldest first.
    checkpoints: VecDeque<ReplaySnapshot<S::State>>,
    /// Maximum length of `checkpoints`.
    checkpoint_capacity: usize,
    /// Earliest index reported changed upstream of the frontier.
    invalid_from: Option<usize>,
}

impl<S: Simulation> ReplayEngine<S> {
    /// Create an engine with the default checkpoint capacity.
    pub fn new(simulation: S, initial: S::State, ticks_per_second: i64) -> Self {
        Self {
            simulation,
            initial,
            ticks_per_second,
            frontier: None,
            checkpoints: VecDeque::with_capacity(DEFAULT_CHECKPOINT_CAPACITY),
            checkpoint_capacity: DEFAULT_CHECKPOINT_CAPACITY,
            invalid_from: None,
        }
    }

    /// Override the number of retained checkpoints (at least 1).
    #[must_use]
    pub fn with_checkpoint_capacity(mut self, capacity: usize) -> Self {
        self.checkpoint_capacity = capacity.max(1);
        while self.checkpoints.len() > self.checkpoint_capacity {
            self.checkpoints.pop_front();
        }
        self
    }

    /// Return the simulation logic.
    pub const fn simulation(&self) -> &S {
        &self.simulation
    }

    /// Return the configured tick rate.
    pub const fn ticks_per_second(&self) -> i64 {
        self.ticks_per_second
    }

    /// Return the most recent snapshot, if any query has run.
    pub const fn frontier(&self) -> Option<&ReplaySnapshot<S::State>> {
        self.frontier.as_ref()
    }

    /// Return the retained checkpoints, oldest first.
    pub const fn checkpoints(&self) -> &VecDeque<ReplaySnapshot<S::State>> {
        &self.checkpoints
    }

    /// Return the earliest index reported changed since the engine last
    /// caught up, if any.
    pub const fn invalidated_from(&self) -> Option<usize> {
        self.invalid_from
    }

    /// Record that the timeline gained a new entry at `index`.
    ///
    /// Checkpoints that folded in entries past `index` are dropped; one
    /// that stopped exactly at `index` is kept and re-checked against the
    /// new entry's time when next considered. If the frontier is affected,
    /// `index` is remembered (keeping the minimum) so the next query will
    /// not resume from it.
    pub fn note_insertion(&mut self, index: usize) {
        if let Some(frontier) = &self.frontier
            && index < frontier.event_index
        {
            let earliest = self.invalid_from.map_or(index, |current| current.min(index));
            self.invalid_from = Some(earliest);
        }

        let before = self.checkpoints.len();
        self.checkpoints.retain(|c| c.event_index <= index);
        let dropped = before.saturating_sub(self.checkpoints.len());
        if dropped > 0 || self.invalid_from.is_some() {
            debug!(
                index,
                dropped,
                invalid_from = ?self.invalid_from,
                "timeline changed upstream of cached replay"
            );
        }
    }

    /// Compute the simulated state at `target_time`.
    ///
    /// Resumes from the newest valid snapshot, replays the remaining events
    /// with time at or before `target_time`, ticks up to `target_time`, and
    /// caches the result as the new frontier.
    pub fn state_at(&mut self, timeline: &Timeline, target_time: i64) -> S::State {
        let Some(origin) = replay_origin(timeline) else {
            self.frontier = Some(ReplaySnapshot {
                event_index: 0,
                query_time: target_time,
                state: self.initial.clone(),
                last_tick_time: target_time,
                origin: target_time,
            });
            self.invalid_from = None;
            return self.initial.clone();
        };

        let start = self.starting_point(timeline, target_time, origin);
        trace!(
            event_index = start.event_index,
            query_time = start.query_time,
            target_time,
            "resuming replay"
        );
        let snapshot = self.replay(timeline, start, target_time);
        let caught_up = snapshot.event_index == timeline.len();
        let state = snapshot.state.clone();
        self.remember(snapshot);

        if caught_up {
            self.invalid_from = None;
        }
        state
    }

    /// Compute the state at `target_time` by full replay, ignoring and
    /// leaving untouched every cached snapshot.
    pub fn state_at_uncached(&self, timeline: &Timeline, target_time: i64) -> S::State {
        match replay_origin(timeline) {
            Some(origin) => {
                let start = self.initial_snapshot(origin);
                self.replay(timeline, start, target_time).state
            }
            None => self.initial.clone(),
        }
    }

    /// Pick the snapshot to resume from.
    fn starting_point(
        &self,
        timeline: &Timeline,
        target_time: i64,
        origin: i64,
    ) -> ReplaySnapshot<S::State> {
        let usable = |s: &ReplaySnapshot<S::State>| {
            s.event_index > 0
                && s.origin == origin
                && s.query_time <= target_time
                && s.event_index <= timeline.len()
                && self.invalid_from.is_none_or(|bound| s.event_index <= bound)
                && timeline
                    .get(s.event_index)
                    .is_none_or(|next| next.time > s.query_time)
        };

        if self.invalid_from.is_none()
            && let Some(frontier) = self.frontier.as_ref().filter(|f| usable(*f))
        {
            return frontier.clone();
        }

        self.checkpoints
            .iter()
            .rev()
            .find(|c| usable(*c))
            .cloned()
            .unwrap_or_else(|| self.initial_snapshot(origin))
    }

    /// Snapshot representing the initial state at the replay origin.
    fn initial_snapshot(&self, origin: i64) -> ReplaySnapshot<S::State> {
        ReplaySnapshot {
            event_index: 0,
            query_time: origin,
            state: self.initial.clone(),
            last_tick_time: origin,
            origin,
        }
    }

    /// Fold events and ticks from `start` up to `target_time`.
    fn replay(
        &self,
        timeline: &Timeline,
        start: ReplaySnapshot<S::State>,
        target_time: i64,
    ) -> ReplaySnapshot<S::State> {
        let origin = start.origin;
        let mut state = start.state;
        let mut cursor = start.last_tick_time;
        let mut index = start.event_index;

        for event in timeline.events().iter().skip(index) {
            if event.time > target_time {
                break;
            }
            if event.time > cursor {
                state = self.advance(state, origin, cursor, event.time);
                cursor = event.time;
            }
            state = self.simulation.apply(state, event);
            index = index.saturating_add(1);
        }

        if target_time > cursor {
            state = self.advance(state, origin, cursor, target_time);
            cursor = target_time;
        }

        ReplaySnapshot {
            event_index: index,
            query_time: target_time,
            state,
            last_tick_time: cursor,
            origin,
        }
    }

    /// Apply every tick whose grid boundary lies in `(from, to]`.
    fn advance(&self, mut state: S::State, origin: i64, from: i64, to: i64) -> S::State {
        for _ in 0..ticks_between(self.ticks_per_second, origin, from, to) {
            state = self.simulation.tick(state);
        }
        state
    }

    /// Store `snapshot` as the frontier and, if new, as a checkpoint.
    fn remember(&mut self, snapshot: ReplaySnapshot<S::State>) {
        let duplicate = self.checkpoints.back().is_some_and(|last| {
            last.event_index == snapshot.event_index && last.query_time == snapshot.query_time
        });
        if snapshot.event_index > 0 && !duplicate {
            self.checkpoints.push_back(snapshot.clone());
            while self.checkpoints.len() > self.checkpoint_capacity {
                self.checkpoints.pop_front();
            }
        }
        self.frontier = Some(snapshot);
    }
}

/// Tick grid origin for the current timeline, or `None` if it is empty.
fn replay_origin(timeline: &Timeline) -> Option<i64> {
    timeline.first_time().map(|t| t.max(0))
}

/// Number of tick boundaries in `(from, to]` on the grid anchored at
/// `origin`.
fn ticks_between(ticks_per_second: i64, origin: i64, from: i64, to: i64) -> u64 {
    if ticks_per_second <= 0 || to <= from {
        return 0;
    }
    let rate = i128::from(ticks_per_second);
    let boundary = |t: i64| {
        (i128::from(t) - i128::from(origin))
            .saturating_mul(rate)
            .div_euclid(MILLIS_PER_SECOND)
    };
    let count = boundary(to).saturating_sub(boundary(from));
    u64::try_from(count).unwrap_or(0)
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

    /// Key-driven mover: `pos` moves one step per tick while a key is held.
    #[derive(Debug, Clone, Copy)]
    struct Mover;

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    struct MoverState {
        pos: i64,
        up: bool,
        down: bool,
    }

    impl Simulation for Mover {
        type State = MoverState;

        fn apply(&self, mut state: MoverState, event: &TimelineEvent) -> MoverState {
            match event.data.as_str() {
                Some("up-pressed") => state.up = true,
                Some("up-released") => state.up = false,
                Some("down-pressed") => state.down = true,
                Some("down-released") => state.down = false,
                _ => {}
            }
            state
        }

        fn tick(&self, mut state: MoverState) -> MoverState {
            if state.up {
                state.pos += 1;
            }
            if state.down {
                state.pos -= 1;
            }
            state
        }
    }

    /// Records every event and tick so replay order is observable.
    #[derive(Debug, Clone, Copy)]
    struct Trace;

    impl Simulation for Trace {
        type State = Vec<String>;

        fn apply(&self, mut state: Vec<String>, event: &TimelineEvent) -> Vec<String> {
            state.push(format!("{}@{}", event.data.as_str().unwrap_or("?"), event.time));
            state
        }

        fn tick(&self, mut state: Vec<String>) -> Vec<String> {
            state.push("tick".to_owned());
            state
        }
    }

    fn mover(tps: i64) -> ReplayEngine<Mover> {
        ReplayEngine::new(Mover, MoverState::default(), tps)
    }

    fn event(data: &str, time: i64) -> TimelineEvent {
        TimelineEvent::unconfirmed(json!(data), time)
    }

    fn pos(state: &MoverState) -> i64 {
        state.pos
    }

    #[test]
    fn empty_timeline_yields_initial_state() {
        let timeline = Timeline::new();
        let mut engine = mover(10);
        assert_eq!(engine.state_at(&timeline, 5_000), MoverState::default());
    }

    #[test]
    fn held_key_ticks_once_per_second() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 0));
        let mut engine = mover(1);

        assert_eq!(pos(&engine.state_at(&timeline, 2_500)), 2);

        let mut fresh = mover(1);
        assert_eq!(pos(&fresh.state_at(&timeline, 1_000)), 1);
        assert_eq!(pos(&fresh.state_at(&timeline, 2_500)), 2);
    }

    #[test]
    fn resumed_replay_matches_full_replay_on_fractional_boundaries() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 0));
        let mut engine = mover(1);

        assert_eq!(pos(&engine.state_at(&timeline, 1_900)), 1);
        assert_eq!(pos(&engine.state_at(&timeline, 2_800)), 2);
        assert_eq!(pos(&engine.state_at(&timeline, 2_999)), 2);
        assert_eq!(pos(&engine.state_at(&timeline, 3_000)), 3);
        assert_eq!(engine.state_at(&timeline, 3_000), engine.state_at_uncached(&timeline, 3_000));
    }

    #[test]
    fn zero_rate_never_ticks() {
        let mut timeline = Timeline::new();
        timeline.insert(event("a", 0));
        timeline.insert(event("b", 10_000));
        let mut engine = ReplayEngine::new(Trace, Vec::new(), 0);
        let state = engine.state_at(&timeline, 60_000);
        assert_eq!(state, vec!["a@0".to_owned(), "b@10000".to_owned()]);

        let mut negative = ReplayEngine::new(Trace, Vec::new(), -5);
        assert_eq!(negative.state_at(&timeline, 60_000).len(), 2);
    }

    #[test]
    fn ticks_are_interleaved_between_events() {
        let mut timeline = Timeline::new();
        timeline.insert(event("a", 1_000));
        timeline.insert(event("b", 3_000));
        let mut engine = ReplayEngine::new(Trace, Vec::new(), 1);

        let state = engine.state_at(&timeline, 4_500);
        assert_eq!(state, vec!["a@1000", "tick", "tick", "b@3000", "tick"]);
    }

    #[test]
    fn no_ticks_before_first_event() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 1_700_000_000_000));
        let mut engine = mover(24);

        assert_eq!(pos(&engine.state_at(&timeline, 1_699_999_999_000)), 0);
        assert_eq!(pos(&engine.state_at(&timeline, 1_700_000_001_000)), 24);
    }

    #[test]
    fn events_after_target_are_ignored() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 0));
        timeline.insert(event("up-released", 5_000));
        let mut engine = mover(1);

        assert_eq!(pos(&engine.state_at(&timeline, 3_000)), 3);
        assert_eq!(pos(&engine.state_at(&timeline, 9_000)), 5);
    }

    #[test]
    fn retroactive_insertion_invalidates_frontier() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 0));
        timeline.insert(event("down-pressed", 1_500));
        let mut engine = mover(1);
        assert_eq!(pos(&engine.state_at(&timeline, 2_000)), 1);

        let outcome = timeline.insert(event("up-released", 500));
        assert_eq!(outcome.index, 1);
        engine.note_insertion(outcome.index);
        assert_eq!(engine.invalidated_from(), Some(1));

        let state = engine.state_at(&timeline, 2_000);
        assert_eq!(state, engine.state_at_uncached(&timeline, 2_000));
        assert_eq!(pos(&state), -1);
        assert_eq!(engine.invalidated_from(), None);
    }

    #[test]
    fn insertion_at_frontier_boundary_is_not_missed() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 0));
        let mut engine = mover(1);
        assert_eq!(pos(&engine.state_at(&timeline, 2_000)), 2);

        // Lands exactly at the frontier's event_index, inside its window.
        let outcome = timeline.insert(event("up-released", 500));
        assert_eq!(outcome.index, 1);
        engine.note_insertion(outcome.index);

        assert_eq!(pos(&engine.state_at(&timeline, 2_000)), 0);
    }

    #[test]
    fn insertion_before_first_event_moves_the_origin() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 1_000));
        let mut engine = mover(1);
        assert_eq!(pos(&engine.state_at(&timeline, 3_000)), 2);

        let outcome = timeline.insert(event("down-pressed", 0));
        engine.note_insertion(outcome.index);
        assert!(engine.checkpoints().is_empty());

        let state = engine.state_at(&timeline, 3_000);
        assert_eq!(state, engine.state_at_uncached(&timeline, 3_000));
    }

    #[test]
    fn appended_events_reuse_the_frontier() {
        let mut timeline = Timeline::new();
        timeline.insert(event("a", 0));
        let mut engine = ReplayEngine::new(Trace, Vec::new(), 1);
        engine.state_at(&timeline, 1_000);

        let outcome = timeline.insert(event("b", 1_500));
        engine.note_insertion(outcome.index);
        assert_eq!(engine.invalidated_from(), None);

        let state = engine.state_at(&timeline, 2_000);
        assert_eq!(state, vec!["a@0", "tick", "b@1500", "tick"]);
        assert_eq!(engine.frontier().unwrap().event_index, 2);
    }

    #[test]
    fn stored_states_are_not_aliased_by_returned_values() {
        let mut timeline = Timeline::new();
        timeline.insert(event("a", 0));
        let mut engine = ReplayEngine::new(Trace, Vec::new(), 1);

        let mut returned = engine.state_at(&timeline, 1_000);
        returned.push("tampered".to_owned());

        assert_eq!(engine.state_at(&timeline, 2_000), vec!["a@0", "tick", "tick"]);
    }

    #[test]
    fn earlier_query_falls_back_to_checkpoint() {
        let mut timeline = Timeline::new();
        timeline.insert(event("up-pressed", 0));
        timeline.insert(event("up-released", 4_000));
        timeline.insert(event("down-pressed", 6_000));
        let mut engine = mover(1);

        for t in [1_000, 5_000, 8_000] {
            engine.state_at(&timeline, t);
        }
        assert_eq!(pos(&engine.state_at(&timeline, 5_500)), 4);
        assert_eq!(pos(&engine.state_at(&timeline, 8_000)), 2);
    }

    #[test]
    fn checkpoint_history_is_bounded() {
        let mut timeline = Timeline::new();
        for i in 0..40 {
            timeline.insert(event("noop", i * 100));
        }
        let mut engine = mover(10).with_checkpoint_capacity(5);
        for i in 0..40 {
            engine.state_at(&timeline, i * 100 + 50);
        }
        assert_eq!(engine.checkpoints().len(), 5);
        assert_eq!(engine.checkpoints().back().unwrap().query_time, 3_950);
        assert_eq!(engine.checkpoints().front().unwrap().query_time, 3_550);
    }

    #[test]
    fn repeated_query_does_not_duplicate_checkpoint() {
        let mut timeline = Timeline::new();
        timeline.insert(event("a", 0));
        let mut engine = mover(1);
        engine.state_at(&timeline, 1_000);
        engine.state_at(&timeline, 1_000);
        assert_eq!(engine.checkpoints().len(), 1);
    }

    #[test]
    fn note_insertion_drops_checkpoints_past_index() {
        let mut timeline = Timeline::new();
        for (i, t) in [0, 1_000, 2_000, 3_000].into_iter().enumerate() {
            timeline.insert(event(&format!("e{i}"), t));
        }
        let mut engine = mover(1);
        for t in [500, 1_500, 2_500, 3_500] {
            engine.state_at(&timeline, t);
        }
        assert_eq!(engine.checkpoints().len(), 4);

        engine.note_insertion(2);
        let kept: Vec<usize> = engine.checkpoints().iter().map(|c| c.event_index).collect();
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(engine.invalidated_from(), Some(2));

        engine.note_insertion(3);
        assert_eq!(engine.invalidated_from(), Some(2));
    }

    #[test]
    fn out_of_order_delivery_converges_with_in_order_delivery() {
        let events = [
            event("up-pressed", 0),
            event("up-released", 2_300),
            event("down-pressed", 3_100),
            event("down-released", 7_700),
            event("up-pressed", 8_000),
        ];

        let mut ordered = Timeline::new();
        for e in &events {
            ordered.insert(e.clone());
        }
        let reference = mover(4).state_at_uncached(&ordered, 10_000);

        let mut shuffled = Timeline::new();
        let mut engine = mover(4);
        for i in [4, 1, 3, 0, 2] {
            let outcome = shuffled.insert(events[i].clone());
            engine.note_insertion(outcome.index);
            engine.state_at(&shuffled, 6_000);
            engine.state_at(&shuffled, 10_000);
        }
        assert_eq!(engine.state_at(&shuffled, 10_000), reference);
    }

    #[test]
    fn tick_counting_on_grid() {
        assert_eq!(ticks_between(1, 0, 0, 2_500), 2);
        assert_eq!(ticks_between(1, 0, 1_900, 2_800), 1);
        assert_eq!(ticks_between(24, 0, 0, 1_000), 24);
        assert_eq!(ticks_between(24, 0, 0, 41), 0);
        assert_eq!(ticks_between(24, 0, 0, 42), 1);
        assert_eq!(ticks_between(1, 500, 500, 1_499), 0);
        assert_eq!(ticks_between(1, 500, 500, 1_500), 1);
        assert_eq!(ticks_between(0, 0, 0, 10_000), 0);
        assert_eq!(ticks_between(5, 0, 3_000, 1_000), 0);
    }
}
