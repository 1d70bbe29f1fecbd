//! Integration tests for the authority server.
//!
//! REST routes are driven through the Axum `Router` via
//! `tower::ServiceExt` without starting a TCP server. The room protocol
//! is driven through [`Connection`], the socket-independent half of the
//! `WebSocket` handler.

#![allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::arithmetic_side_effects
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use lockstep_core::{LocalClock, ReplayEngine, Session, Simulation};
use lockstep_server::router::build_router;
use lockstep_server::state::AppState;
use lockstep_server::store::EventStore;
use lockstep_server::ws::Connection;
use lockstep_types::{ClientMessage, PostMessage, RoomId, ServerMessage, TimelineEvent};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

/// Manually advanced clock.
#[derive(Debug, Default)]
struct StepClock(AtomicI64);

impl StepClock {
    fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl LocalClock for StepClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn room(raw: &str) -> RoomId {
    RoomId::parse(raw).unwrap()
}

fn state_with_clock() -> (Arc<AppState>, Arc<StepClock>) {
    let clock = Arc::new(StepClock::default());
    let state = AppState::in_memory().with_clock(Arc::clone(&clock) as Arc<dyn LocalClock>);
    (Arc::new(state), clock)
}

fn connect(state: &Arc<AppState>) -> (Connection, mpsc::Receiver<ServerMessage>) {
    let (tx, rx) = mpsc::channel(64);
    (Connection::new(Arc::clone(state), tx), rx)
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

fn post(room_id: &RoomId, data: Value, time: i64) -> ClientMessage {
    ClientMessage::Post {
        room_id: room_id.clone(),
        message: PostMessage { data, time },
    }
}

async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
    let response = build_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clock_probe_echoes_client_time() {
    let (state, clock) = state_with_clock();
    clock.set(5_000);
    let (mut conn, _rx) = connect(&state);

    let reply = conn
        .handle_text(r#"{"type":"get time","client_time":1234}"#)
        .await;
    assert_eq!(
        reply,
        Some(ServerMessage::InformTime {
            server_time: 5_000,
            client_time: Some(1_234),
        })
    );
}

#[tokio::test]
async fn posts_are_stamped_and_fanned_out_to_watchers_only() {
    let (state, clock) = state_with_clock();
    let a = room("a1");
    let b = room("b2");

    let (mut watcher_a, mut rx_a) = connect(&state);
    let (mut watcher_b, mut rx_b) = connect(&state);
    let (mut producer, mut rx_p) = connect(&state);
    watcher_a.handle(ClientMessage::Watch { room_id: a.clone() }).await;
    watcher_b.handle(ClientMessage::Watch { room_id: b.clone() }).await;

    clock.set(1_050);
    assert!(producer.handle(post(&a, json!("up-pressed"), 1_000)).await.is_none());

    let ServerMessage::Post(envelope) = next_frame(&mut rx_a).await else {
        panic!("expected post");
    };
    assert_eq!(envelope.room_id, a);
    assert_eq!(envelope.message.time, 1_000);
    assert_eq!(envelope.message.server_received_at, 1_050);

    assert!(rx_b.try_recv().is_err());
    assert!(rx_p.try_recv().is_err());
}

#[tokio::test]
async fn repeated_post_is_broadcast_once() {
    let (state, clock) = state_with_clock();
    let a = room("c0ffee");
    let (mut watcher, mut rx) = connect(&state);
    let (mut producer, _rx_p) = connect(&state);
    watcher.handle(ClientMessage::Watch { room_id: a.clone() }).await;

    clock.set(10);
    producer.handle(post(&a, json!({"k": 1}), 5)).await;
    clock.set(20);
    producer.handle(post(&a, json!({"k": 1}), 5)).await;
    producer.handle(post(&a, json!({"k": 2}), 5)).await;

    let ServerMessage::Post(first) = next_frame(&mut rx).await else {
        panic!("expected post");
    };
    let ServerMessage::Post(second) = next_frame(&mut rx).await else {
        panic!("expected post");
    };
    assert_eq!(first.message.data, json!({"k": 1}));
    assert_eq!(second.message.data, json!({"k": 2}));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unwatch_stops_delivery() {
    let (state, _clock) = state_with_clock();
    let a = room("ab");
    let (mut watcher, mut rx) = connect(&state);
    let (mut producer, _rx_p) = connect(&state);

    watcher.handle(ClientMessage::Watch { room_id: a.clone() }).await;
    assert_eq!(watcher.watched_rooms().count(), 1);
    watcher.handle(ClientMessage::Unwatch { room_id: a.clone() }).await;
    assert_eq!(watcher.watched_rooms().count(), 0);

    producer.handle(post(&a, json!("x"), 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn slow_watcher_is_reported_as_lagged() {
    let (state, clock) = state_with_clock();
    let a = room("1a9");
    let (tx, mut rx) = mpsc::channel(1);
    let mut watcher = Connection::new(Arc::clone(&state), tx);
    let (mut producer, _rx_p) = connect(&state);
    watcher.handle(ClientMessage::Watch { room_id: a.clone() }).await;

    // More posts than the room buffer plus the connection queue can hold.
    for i in 0..300 {
        clock.set(i);
        producer.handle(post(&a, json!(i), i)).await;
    }

    let lagged = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            tokio::select! {
                Some(room_id) = watcher.lagged() => return room_id,
                Some(_) = rx.recv() => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(lagged, a);

    // The forwarder is gone; the rest is recovered by resync.
    let hub = state.room(&a).await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while hub.watcher_count() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let Some(ServerMessage::ResyncResponse { messages, .. }) = watcher
        .handle(ClientMessage::Resync {
            room_id: a.clone(),
            since: 0,
        })
        .await
    else {
        panic!("expected resync response");
    };
    assert_eq!(messages.len(), 300);
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let (state, _clock) = state_with_clock();
    let (mut conn, _rx) = connect(&state);

    assert!(conn.handle_text("not json").await.is_none());
    assert!(conn.handle_text(r#"{"type":"watch","room_id":"zz"}"#).await.is_none());
    assert!(conn.handle_text(r#"{"type":"dance"}"#).await.is_none());
    assert_eq!(conn.watched_rooms().count(), 0);
    assert!(state.room_ids().await.is_empty());

    // The connection still works afterwards.
    let reply = conn.handle_text(r#"{"type":"get time","clientTime":1}"#).await;
    assert!(matches!(reply, Some(ServerMessage::InformTime { .. })));
}

#[tokio::test]
async fn resync_returns_matching_history() {
    let (state, clock) = state_with_clock();
    let a = room("dd");
    let (mut conn, _rx) = connect(&state);

    for (time, stamp) in [(100, 110), (200, 210), (300, 310)] {
        clock.set(stamp);
        conn.handle(post(&a, json!(time), time)).await;
    }

    let reply = conn
        .handle(ClientMessage::Resync {
            room_id: a.clone(),
            since: 210,
        })
        .await;
    let Some(ServerMessage::ResyncResponse { room_id, messages }) = reply else {
        panic!("expected resync-response");
    };
    assert_eq!(room_id, a);
    let times: Vec<i64> = messages.iter().map(|m| m.message.time).collect();
    assert_eq!(times, vec![200, 300]);
}

/// Sums every numeric payload; no ticking.
#[derive(Debug, Clone, Copy)]
struct Sum;

impl Simulation for Sum {
    type State = i64;

    fn apply(&self, state: i64, event: &TimelineEvent) -> i64 {
        state.saturating_add(event.data.as_i64().unwrap_or(0))
    }

    fn tick(&self, state: i64) -> i64 {
        state
    }
}

#[tokio::test]
async fn reconnecting_watcher_converges_after_resync() {
    let (state, clock) = state_with_clock();
    let a = room("f00d");
    let (mut producer, _rx_p) = connect(&state);

    let mut steady = Session::new(ReplayEngine::new(Sum, 0, 0));
    let mut flaky = Session::new(ReplayEngine::new(Sum, 0, 0));

    let (mut steady_conn, mut steady_rx) = connect(&state);
    steady_conn.handle(ClientMessage::Watch { room_id: a.clone() }).await;
    let (mut flaky_conn, mut flaky_rx) = connect(&state);
    flaky_conn.handle(ClientMessage::Watch { room_id: a.clone() }).await;

    for (i, value) in [1, 2, 3, 4, 5].into_iter().enumerate() {
        let stamp = 1_000 + i64::try_from(i).unwrap() * 100;
        clock.set(stamp);

        // The flaky watcher drops out for the middle three posts.
        if i == 1 {
            flaky_conn.close();
        }
        producer.handle(post(&a, json!(value), stamp - 5)).await;

        let ServerMessage::Post(envelope) = next_frame(&mut steady_rx).await else {
            panic!("expected post");
        };
        steady.insert(envelope.message.into_event());

        if i == 0 {
            let ServerMessage::Post(envelope) = next_frame(&mut flaky_rx).await else {
                panic!("expected post");
            };
            flaky.insert(envelope.message.into_event());
        }
    }

    // Reconnect: watch again and resync from the watermark.
    let (mut flaky_conn, _flaky_rx) = connect(&state);
    flaky_conn.handle(ClientMessage::Watch { room_id: a.clone() }).await;
    let reply = flaky_conn
        .handle(ClientMessage::Resync {
            room_id: a.clone(),
            since: flaky.watermark(),
        })
        .await;
    let Some(ServerMessage::ResyncResponse { messages, .. }) = reply else {
        panic!("expected resync-response");
    };
    flaky.merge(messages.into_iter().map(|m| m.message.into_event()));

    assert_eq!(flaky.timeline().events(), steady.timeline().events());
    assert_eq!(flaky.state_at(10_000), 15);
    assert_eq!(steady.state_at(10_000), 15);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rooms_are_restored_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let a = room("12ab");

    {
        let (store, writer) = EventStore::open(dir.path(), 16).await.unwrap();
        let state = AppState::new(store, 16);
        state
            .post(&a, PostMessage { data: json!("first"), time: 10 })
            .await
            .unwrap();
        state
            .post(&a, PostMessage { data: json!("second"), time: 20 })
            .await
            .unwrap();
        drop(state);
        writer.await.unwrap();
    }

    let (store, _writer) = EventStore::open(dir.path(), 16).await.unwrap();
    let state = Arc::new(AppState::new(store, 16));
    assert!(state.existing_room(&a).await.is_none());

    let history = state.resync(&a, 0).await;
    let data: Vec<Value> = history.into_iter().map(|e| e.message.data).collect();
    assert_eq!(data, vec![json!("first"), json!("second")]);

    // A repeat of a stored event is still recognised after restart.
    assert!(
        state
            .post(&a, PostMessage { data: json!("first"), time: 10 })
            .await
            .is_none()
    );
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_room_count() {
    let (state, _clock) = state_with_clock();
    state.room(&room("01")).await;

    let (status, body) = get_json(state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["rooms"], 1);
}

#[tokio::test]
async fn list_rooms_returns_referenced_ids() {
    let (state, _clock) = state_with_clock();
    state.room(&room("bb")).await;
    state.room(&room("aa")).await;

    let (status, body) = get_json(state, "/api/rooms").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["aa", "bb"]));
}

#[tokio::test]
async fn room_events_returns_ordered_timeline() {
    let (state, clock) = state_with_clock();
    let a = room("ace");
    clock.set(500);
    state.post(&a, PostMessage { data: json!("late"), time: 300 }).await;
    state.post(&a, PostMessage { data: json!("early"), time: 100 }).await;

    let (status, body) = get_json(Arc::clone(&state), "/api/rooms/ace/events").await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["data"], "early");
    assert_eq!(events[1]["data"], "late");
    assert_eq!(events[1]["server_received_at"], 500);

    let (_, filtered) = get_json(state, "/api/rooms/ace/events?since=200").await;
    assert_eq!(filtered.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn room_events_rejects_invalid_id() {
    let (state, _clock) = state_with_clock();
    let (status, body) = get_json(state, "/api/rooms/not-hex/events").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let (state, _clock) = state_with_clock();
    let (status, body) = get_json(state, "/api/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}
