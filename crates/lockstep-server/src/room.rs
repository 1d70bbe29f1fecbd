//! Per-room authority state.
//!
//! A [`RoomHub`] owns one room's timeline and its broadcast channel. All
//! mutation happens under the hub's lock, so posts to one room are
//! stamped, merged and broadcast in a single order while other rooms
//! proceed independently.

use lockstep_core::Timeline;
use lockstep_types::{PostEnvelope, PostMessage, RoomId, StampedMessage, TimelineEvent};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Mutable part of a hub, guarded together.
#[derive(Debug)]
struct RoomLedger {
    timeline: Timeline,
    /// Highest arrival stamp handed out so far.
    last_stamp: i64,
}

/// Timeline and watcher fan-out for one room.
#[derive(Debug)]
pub struct RoomHub {
    room_id: RoomId,
    ledger: Mutex<RoomLedger>,
    tx: broadcast::Sender<PostEnvelope>,
}

impl RoomHub {
    /// Create a hub seeded with previously persisted envelopes.
    pub fn hydrate(
        room_id: RoomId,
        history: impl IntoIterator<Item = PostEnvelope>,
        broadcast_capacity: usize,
    ) -> Self {
        let mut timeline = Timeline::new();
        let mut last_stamp = i64::MIN;
        for envelope in history {
            last_stamp = last_stamp.max(envelope.message.server_received_at);
            timeline.insert(envelope.message.into_event());
        }
        let (tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            room_id,
            ledger: Mutex::new(RoomLedger {
                timeline,
                last_stamp,
            }),
            tx,
        }
    }

    /// Return the room this hub serves.
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Subscribe to stamped posts for this room.
    pub fn subscribe(&self) -> broadcast::Receiver<PostEnvelope> {
        self.tx.subscribe()
    }

    /// Return the number of current watchers.
    pub fn watcher_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Stamp, merge and broadcast one submitted event.
    ///
    /// The stamp is `now`, raised if needed so stamps never decrease
    /// within a room. Returns `None` if an equivalent event was already
    /// accepted; such repeats are neither re-broadcast nor re-stamped.
    pub async fn accept(&self, message: PostMessage, now: i64) -> Option<PostEnvelope> {
        let mut ledger = self.ledger.lock().await;
        let stamp = now.max(ledger.last_stamp);
        let stamped = StampedMessage::stamp(message, stamp);

        let outcome = ledger.timeline.insert(stamped.clone().into_event());
        if !outcome.inserted {
            debug!(room_id = %self.room_id, time = stamped.time, "duplicate post ignored");
            return None;
        }
        ledger.last_stamp = stamp;

        let envelope = PostEnvelope {
            room_id: self.room_id.clone(),
            message: stamped,
        };
        // No watchers is not an error.
        let delivered = self.tx.send(envelope.clone()).unwrap_or(0);
        debug!(
            room_id = %self.room_id,
            index = outcome.index,
            delivered,
            "post accepted"
        );
        Some(envelope)
    }

    /// Return the envelopes a resync from `since` should receive, ordered
    /// by arrival stamp.
    pub async fn history_since(&self, since: i64) -> Vec<PostEnvelope> {
        let events = self.events().await;
        let mut envelopes: Vec<PostEnvelope> = events
            .into_iter()
            .filter_map(|event| self.envelope_for(event))
            .filter(|envelope| envelope.matches_since(since))
            .collect();
        envelopes.sort_by_key(|e| e.message.server_received_at);
        envelopes
    }

    /// Return a detached copy of the room timeline.
    pub async fn events(&self) -> Vec<TimelineEvent> {
        self.ledger.lock().await.timeline.snapshot()
    }

    /// Return the number of events in the room timeline.
    pub async fn event_count(&self) -> usize {
        self.ledger.lock().await.timeline.len()
    }

    fn envelope_for(&self, event: TimelineEvent) -> Option<PostEnvelope> {
        let server_received_at = event.received_at?;
        Some(PostEnvelope {
            room_id: self.room_id.clone(),
            message: StampedMessage {
                data: event.data,
                time: event.time,
                server_received_at,
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hub() -> RoomHub {
        RoomHub::hydrate(RoomId::parse("beef").unwrap(), Vec::new(), 16)
    }

    fn post(data: &str, time: i64) -> PostMessage {
        PostMessage {
            data: json!(data),
            time,
        }
    }

    #[tokio::test]
    async fn accepted_posts_reach_watchers() {
        let hub = hub();
        let mut rx = hub.subscribe();
        assert_eq!(hub.watcher_count(), 1);

        let envelope = hub.accept(post("up-pressed", 1_000), 1_005).await.unwrap();
        assert_eq!(envelope.message.server_received_at, 1_005);
        assert_eq!(rx.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn repeated_post_is_absorbed() {
        let hub = hub();
        let mut rx = hub.subscribe();
        assert!(hub.accept(post("x", 10), 20).await.is_some());
        assert!(hub.accept(post("x", 10), 30).await.is_none());

        assert_eq!(hub.event_count().await, 1);
        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stamps_never_decrease() {
        let hub = hub();
        let first = hub.accept(post("a", 0), 500).await.unwrap();
        let second = hub.accept(post("b", 0), 400).await.unwrap();
        assert_eq!(first.message.server_received_at, 500);
        assert_eq!(second.message.server_received_at, 500);
    }

    #[tokio::test]
    async fn hydrated_history_is_deduplicated_and_resumes_stamps() {
        let room = RoomId::parse("beef").unwrap();
        let stored = PostEnvelope {
            room_id: room.clone(),
            message: StampedMessage {
                data: json!("a"),
                time: 10,
                server_received_at: 900,
            },
        };
        let hub = RoomHub::hydrate(room, vec![stored.clone(), stored], 16);
        assert_eq!(hub.event_count().await, 1);

        assert!(hub.accept(post("a", 10), 1_000).await.is_none());
        let next = hub.accept(post("b", 20), 100).await.unwrap();
        assert_eq!(next.message.server_received_at, 900);
    }

    #[tokio::test]
    async fn history_since_filters_on_either_timestamp() {
        let hub = hub();
        hub.accept(post("a", 100), 105).await;
        hub.accept(post("b", 90), 300).await;
        hub.accept(post("c", 400), 405).await;

        let since_200: Vec<_> = hub
            .history_since(200)
            .await
            .into_iter()
            .map(|e| e.message.data)
            .collect();
        assert_eq!(since_200, vec![json!("b"), json!("c")]);

        let all = hub.history_since(0).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message.data, json!("a"));
    }
}
