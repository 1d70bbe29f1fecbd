//! The room timeline: an ordered, deduplicating log of events.
//!
//! A [`Timeline`] holds every [`TimelineEvent`] known for one room, sorted
//! by non-decreasing `time`. Events may arrive out of order (late live
//! delivery, resync backfill) and more than once; the timeline absorbs
//! both without ever rejecting an event.
//!
//! # Merge Rule
//!
//! Two events are equivalent when their `time` and payload are equal.
//! An equivalent event is never stored twice. The stored copy is replaced
//! in place only when the newcomer carries a finite arrival stamp strictly
//! earlier than the stored one (an authority confirmation superseding a
//! local optimistic entry). Replacing in place does not move any index.
//!
//! # Notifications
//!
//! Every genuine insertion (not a replacement) is published as an
//! [`Insertion`] on a broadcast channel so replay caches and renderers
//! can learn how far back history changed.

use lockstep_types::TimelineEvent;
use tokio::sync::broadcast;

/// Capacity of the insertion notification channel.
///
/// Subscribers that fall behind by more than this many insertions
/// receive [`broadcast::error::RecvError::Lagged`].
const INSERTION_CHANNEL_CAPACITY: usize = 256;

/// Result of [`Timeline::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Index of the new or matching entry.
    pub index: usize,
    /// Whether a new entry was added.
    pub inserted: bool,
    /// Whether an equivalent entry was replaced in place.
    pub replaced: bool,
}

/// Notification published for every genuine insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Insertion {
    /// Index the event landed at. Entries at and after it shifted.
    pub index: usize,
    /// The inserted event.
    pub event: TimelineEvent,
}

/// Ordered, deduplicating event log for one room.
#[derive(Debug)]
pub struct Timeline {
    /// Events sorted by non-decreasing `time`.
    events: Vec<TimelineEvent>,
    /// Sender for insertion notifications.
    notify: broadcast::Sender<Insertion>,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(INSERTION_CHANNEL_CAPACITY);
        Self {
            events: Vec::new(),
            notify,
        }
    }

    /// Return the number of stored events.
    pub const fn len(&self) -> usize {
        self.events.len()
    }

    /// Return whether the timeline has no events.
    pub const fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Borrow the ordered events.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Return the event at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&TimelineEvent> {
        self.events.get(index)
    }

    /// Time of the earliest event, if any.
    pub fn first_time(&self) -> Option<i64> {
        self.events.first().map(|e| e.time)
    }

    /// Return an owned copy of the ordered events.
    ///
    /// The copy is detached: later merges into the timeline are never
    /// visible through it.
    pub fn snapshot(&self) -> Vec<TimelineEvent> {
        self.events.clone()
    }

    /// Subscribe to insertion notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Insertion> {
        self.notify.subscribe()
    }

    /// Latest authority arrival time incorporated, or 0 when nothing
    /// confirmed is stored.
    ///
    /// Used as the `since` bound of a resync request after a reconnect.
    pub fn watermark(&self) -> i64 {
        self.events
            .iter()
            .filter_map(|e| e.received_at)
            .max()
            .unwrap_or(0)
    }

    /// Insert an event, merging it with an equivalent entry if present.
    ///
    /// In-order delivery (time at or after the last entry) appends. An
    /// earlier event is spliced in before the first entry whose time is
    /// greater than or equal to its own.
    pub fn insert(&mut self, event: TimelineEvent) -> InsertOutcome {
        if let Some(index) = self.find_equivalent(&event) {
            let replaced = match self.events.get_mut(index) {
                Some(existing) if event.supersedes(existing) => {
                    *existing = event;
                    true
                }
                _ => false,
            };
            return InsertOutcome {
                index,
                inserted: false,
                replaced,
            };
        }

        let in_order = self.events.last().is_none_or(|last| event.time >= last.time);
        let index = if in_order {
            self.events.len()
        } else {
            self.events.partition_point(|e| e.time < event.time)
        };
        self.events.insert(index, event.clone());

        // No receivers is the normal case when nobody watches this timeline.
        let _ = self.notify.send(Insertion { index, event });

        InsertOutcome {
            index,
            inserted: true,
            replaced: false,
        }
    }

    /// Find the index of an entry equivalent to `event`.
    ///
    /// Equivalent entries share a time, so only the run of entries with
    /// that exact time is scanned.
    fn find_equivalent(&self, event: &TimelineEvent) -> Option<usize> {
        let start = self.events.partition_point(|e| e.time < event.time);
        self.events
            .iter()
            .enumerate()
            .skip(start)
            .take_while(|(_, e)| e.time == event.time)
            .find(|(_, e)| e.is_equivalent(event))
            .map(|(i, _)| i)
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    fn local(data: &str, time: i64) -> TimelineEvent {
        TimelineEvent::unconfirmed(json!(data), time)
    }

    fn confirmed(data: &str, time: i64, received_at: i64) -> TimelineEvent {
        TimelineEvent::confirmed(json!(data), time, received_at)
    }

    fn times(timeline: &Timeline) -> Vec<i64> {
        timeline.events().iter().map(|e| e.time).collect()
    }

    #[test]
    fn in_order_delivery_appends() {
        let mut timeline = Timeline::new();
        for (i, t) in [10, 20, 20, 30].into_iter().enumerate() {
            let outcome = timeline.insert(local(&format!("e{i}"), t));
            assert!(outcome.inserted);
            assert_eq!(outcome.index, i);
        }
        assert_eq!(times(&timeline), vec![10, 20, 20, 30]);
    }

    #[test]
    fn late_event_is_spliced_before_equal_or_later_times() {
        let mut timeline = Timeline::new();
        timeline.insert(local("a", 10));
        timeline.insert(local("b", 30));
        timeline.insert(local("c", 40));

        let outcome = timeline.insert(local("d", 30));
        assert_eq!(
            outcome,
            InsertOutcome {
                index: 1,
                inserted: true,
                replaced: false
            }
        );
        assert_eq!(times(&timeline), vec![10, 30, 30, 40]);
        assert_eq!(timeline.events()[1].data, json!("d"));

        let outcome = timeline.insert(local("e", 5));
        assert_eq!(outcome.index, 0);
        assert_eq!(times(&timeline), vec![5, 10, 30, 30, 40]);
    }

    #[test]
    fn duplicate_is_merged_not_stored_twice() {
        let mut timeline = Timeline::new();
        timeline.insert(confirmed("up", 100, 105));
        let outcome = timeline.insert(confirmed("up", 100, 105));
        assert_eq!(
            outcome,
            InsertOutcome {
                index: 0,
                inserted: false,
                replaced: false
            }
        );
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn earlier_confirmation_replaces_local_entry() {
        let mut timeline = Timeline::new();
        timeline.insert(local("up", 100));
        timeline.insert(local("down", 200));

        let outcome = timeline.insert(confirmed("up", 100, 150));
        assert!(outcome.replaced);
        assert!(!outcome.inserted);
        assert_eq!(outcome.index, 0);
        assert_eq!(timeline.events()[0].received_at, Some(150));

        // A later confirmation never degrades the stored stamp.
        let outcome = timeline.insert(confirmed("up", 100, 170));
        assert!(!outcome.replaced);
        assert_eq!(timeline.events()[0].received_at, Some(150));

        // Neither does a local copy.
        let outcome = timeline.insert(local("up", 100));
        assert!(!outcome.replaced);
        assert_eq!(timeline.events()[0].received_at, Some(150));
    }

    #[test]
    fn same_payload_at_different_times_is_distinct() {
        let mut timeline = Timeline::new();
        timeline.insert(local("up", 1));
        timeline.insert(local("up", 2));
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn order_holds_for_every_insertion_order() {
        let base = [50, 10, 40, 10, 30, 20, 60, 0, 25];
        for rotation in 0..base.len() {
            let mut timeline = Timeline::new();
            let mut order = base.to_vec();
            order.rotate_left(rotation);
            for (i, t) in order.iter().enumerate() {
                timeline.insert(local(&format!("e{t}-{i}"), *t));
                let ts = times(&timeline);
                assert!(ts.windows(2).all(|w| w[0] <= w[1]), "unsorted: {ts:?}");
            }
            assert_eq!(timeline.len(), base.len());
        }
    }

    #[test]
    fn snapshot_is_detached() {
        let mut timeline = Timeline::new();
        timeline.insert(local("up", 10));
        let snapshot = timeline.snapshot();

        timeline.insert(confirmed("up", 10, 11));
        assert_eq!(snapshot[0].received_at, None);
        assert_eq!(timeline.events()[0].received_at, Some(11));
    }

    #[test]
    fn watermark_tracks_latest_confirmation() {
        let mut timeline = Timeline::new();
        assert_eq!(timeline.watermark(), 0);

        timeline.insert(local("a", 5));
        assert_eq!(timeline.watermark(), 0);

        timeline.insert(confirmed("b", 10, 12));
        timeline.insert(confirmed("c", 8, 20));
        assert_eq!(timeline.watermark(), 20);
    }

    #[test]
    fn notifies_only_genuine_insertions() {
        let mut timeline = Timeline::new();
        let mut rx = timeline.subscribe();

        timeline.insert(local("a", 10));
        timeline.insert(local("b", 5));
        timeline.insert(confirmed("a", 10, 11));
        timeline.insert(local("b", 5));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.event.data, json!("a"));

        let second = rx.try_recv().unwrap();
        assert_eq!(second.index, 0);
        assert_eq!(second.event.data, json!("b"));

        assert!(rx.try_recv().is_err());
    }
}
