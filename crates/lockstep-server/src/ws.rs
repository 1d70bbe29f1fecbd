//! `WebSocket` protocol handler.
//!
//! Each connection runs one loop that reads client frames and writes
//! server frames. Watching a room spawns a forwarding task that relays
//! the room's broadcasts into the connection's outbound queue; unwatching
//! or disconnecting aborts it.
//!
//! Malformed frames (non-JSON, unknown `type`, invalid `room_id`) are
//! logged and ignored; the connection stays open.
//!
//! A watcher that falls further behind than the room's broadcast buffer
//! has missed posts. Its forwarder stops and reports the room through
//! [`Connection::lagged`]; the socket loop then closes the connection so
//! the client reconnects and resyncs from its watermark.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use lockstep_types::{ClientMessage, RoomId, ServerMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Outbound frames buffered per connection before forwarders wait.
const OUTBOUND_CAPACITY: usize = 256;

/// Pending lag reports per connection; one is enough to close it.
const LAG_CAPACITY: usize = 4;

/// Upgrade an HTTP request to a `WebSocket` connection.
///
/// # Route
///
/// `GET /` and `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

/// Per-connection protocol state, independent of the socket.
#[derive(Debug)]
pub struct Connection {
    state: Arc<AppState>,
    watches: BTreeMap<RoomId, JoinHandle<()>>,
    outbound: mpsc::Sender<ServerMessage>,
    lag_tx: mpsc::Sender<RoomId>,
    lag_rx: mpsc::Receiver<RoomId>,
}

impl Connection {
    /// Create a connection whose room broadcasts are queued on `outbound`.
    pub fn new(state: Arc<AppState>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        let (lag_tx, lag_rx) = mpsc::channel(LAG_CAPACITY);
        Self {
            state,
            watches: BTreeMap::new(),
            outbound,
            lag_tx,
            lag_rx,
        }
    }

    /// Wait until a watched room's forwarder falls behind and return the
    /// room. Posts were lost for that room; the caller should drop the
    /// connection.
    pub async fn lagged(&mut self) -> Option<RoomId> {
        self.lag_rx.recv().await
    }

    /// Return the rooms this connection watches.
    pub fn watched_rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.watches.keys()
    }

    /// Decode and handle one text frame.
    ///
    /// Returns the direct reply, if the frame calls for one. Undecodable
    /// frames are logged and produce no reply.
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame");
                None
            }
        }
    }

    /// Handle one decoded client message.
    pub async fn handle(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        match message {
            ClientMessage::GetTime { client_time } => Some(ServerMessage::InformTime {
                server_time: self.state.now_millis(),
                client_time: Some(client_time),
            }),
            ClientMessage::Watch { room_id } => {
                self.watch(room_id).await;
                None
            }
            ClientMessage::Unwatch { room_id } => {
                self.unwatch(&room_id);
                None
            }
            ClientMessage::Post { room_id, message } => {
                self.state.post(&room_id, message).await;
                None
            }
            ClientMessage::Resync { room_id, since } => {
                let messages = self.state.resync(&room_id, since).await;
                debug!(room_id = %room_id, since, count = messages.len(), "resync served");
                Some(ServerMessage::ResyncResponse { room_id, messages })
            }
        }
    }

    async fn watch(&mut self, room_id: RoomId) {
        if self.watches.contains_key(&room_id) {
            return;
        }
        let hub = self.state.room(&room_id).await;
        let rx = hub.subscribe();
        let task = tokio::spawn(forward_room(
            room_id.clone(),
            rx,
            self.outbound.clone(),
            self.lag_tx.clone(),
        ));
        info!(room_id = %room_id, watchers = hub.watcher_count(), "watch");
        self.watches.insert(room_id, task);
    }

    fn unwatch(&mut self, room_id: &RoomId) {
        if let Some(task) = self.watches.remove(room_id) {
            task.abort();
            info!(room_id = %room_id, "unwatch");
        }
    }

    /// Stop every forwarding task.
    pub fn close(&mut self) {
        for (_, task) in core::mem::take(&mut self.watches) {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Relay one room's broadcasts into a connection's outbound queue.
async fn forward_room(
    room_id: RoomId,
    mut rx: broadcast::Receiver<lockstep_types::PostEnvelope>,
    outbound: mpsc::Sender<ServerMessage>,
    lagged: mpsc::Sender<RoomId>,
) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if outbound.send(ServerMessage::Post(envelope)).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(room_id = %room_id, skipped = n, "watcher lagged, dropping connection");
                if lagged.try_send(room_id).is_err() {
                    debug!("lag already reported");
                }
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Serialize and send one server frame. Returns `false` if the socket
/// is gone.
async fn send_frame(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "failed to serialize server frame");
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

/// Handle the `WebSocket` lifecycle.
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("WebSocket client connected");

    let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut connection = Connection::new(state, tx);

    loop {
        tokio::select! {
            Some(room_id) = connection.lagged() => {
                info!(room_id = %room_id, "closing lagged connection");
                if socket.send(Message::Close(None)).await.is_err() {
                    debug!("WebSocket client disconnected (close failed)");
                }
                break;
            }
            Some(outgoing) = rx.recv() => {
                if !send_frame(&mut socket, &outgoing).await {
                    debug!("WebSocket client disconnected (send failed)");
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = connection.handle_text(text.as_str()).await
                            && !send_frame(&mut socket, &reply).await
                        {
                            debug!("WebSocket client disconnected (reply failed)");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            debug!("WebSocket client disconnected (pong failed)");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {
                        debug!("ignoring non-text frame");
                    }
                }
            }
        }
    }

    connection.close();
}
