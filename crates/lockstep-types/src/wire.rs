//! JSON wire messages exchanged over the `WebSocket` connection.
//!
//! Every frame is a JSON object tagged by its `type` field. Participants
//! send [`ClientMessage`] frames; the authority answers with
//! [`ServerMessage`] frames. A `post` envelope stamped by the authority
//! ([`PostEnvelope`]) is also the record format of the per-room store.
//!
//! | Direction | `type` | Payload |
//! |-----------|--------|---------|
//! | client -> server | `get time` | `client_time` |
//! | server -> client | `inform time` | `server_time`, echoed `client_time` |
//! | client -> server | `watch` / `unwatch` | `room_id` |
//! | client -> server | `post` | `room_id`, `message: {data, time}` |
//! | server -> client | `post` | `room_id`, `message: {data, time, server_received_at}` |
//! | client -> server | `resync` | `room_id`, `since` |
//! | server -> client | `resync-response` | `room_id`, `messages` |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::TimelineEvent;
use crate::room::RoomId;

/// An event as submitted by a producer, before the authority stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostMessage {
    /// Opaque payload.
    pub data: Value,
    /// Producer time, corrected by its clock offset estimate.
    pub time: i64,
}

/// An event as forwarded and persisted by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedMessage {
    /// Opaque payload.
    pub data: Value,
    /// Producer time, corrected by its clock offset estimate.
    pub time: i64,
    /// Authority clock reading when the post arrived.
    pub server_received_at: i64,
}

impl StampedMessage {
    /// Stamp a submitted message with the authority's arrival time.
    pub fn stamp(message: PostMessage, server_received_at: i64) -> Self {
        Self {
            data: message.data,
            time: message.time,
            server_received_at,
        }
    }

    /// Convert into a confirmed timeline event.
    pub fn into_event(self) -> TimelineEvent {
        TimelineEvent::confirmed(self.data, self.time, self.server_received_at)
    }
}

/// A stamped `post` addressed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostEnvelope {
    /// The room the event belongs to.
    pub room_id: RoomId,
    /// The stamped event.
    pub message: StampedMessage,
}

impl PostEnvelope {
    /// Whether this envelope belongs in a resync answer for `since`.
    ///
    /// Matches on either the producer time or the authority arrival time,
    /// so both time-based and watermark-based requests are answered.
    pub const fn matches_since(&self, since: i64) -> bool {
        self.message.time >= since || self.message.server_received_at >= since
    }
}

/// Frames sent by participants to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Clock probe stamped with the sender's local time.
    #[serde(rename = "get time")]
    GetTime {
        /// Local clock reading when the probe was sent.
        #[serde(alias = "clientTime")]
        client_time: i64,
    },

    /// Subscribe this connection to a room's broadcasts.
    #[serde(rename = "watch")]
    Watch {
        /// Room to subscribe to.
        room_id: RoomId,
    },

    /// Remove this connection's subscription to a room.
    #[serde(rename = "unwatch")]
    Unwatch {
        /// Room to unsubscribe from.
        room_id: RoomId,
    },

    /// Submit one event to a room.
    #[serde(rename = "post")]
    Post {
        /// Target room.
        room_id: RoomId,
        /// The event to submit.
        message: PostMessage,
    },

    /// Request persisted history for a room.
    #[serde(rename = "resync")]
    Resync {
        /// Room whose history is requested.
        room_id: RoomId,
        /// Lower bound (inclusive) on event or arrival time.
        since: i64,
    },
}

/// Frames sent by the authority to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Reply to a clock probe.
    #[serde(rename = "inform time")]
    InformTime {
        /// Authority clock reading at reply time.
        #[serde(alias = "serverTime")]
        server_time: i64,
        /// The probe's `client_time`, echoed back when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_time: Option<i64>,
    },

    /// A stamped event forwarded to a room's watchers.
    #[serde(rename = "post")]
    Post(PostEnvelope),

    /// Answer to a `resync` request.
    #[serde(rename = "resync-response")]
    ResyncResponse {
        /// Room the history belongs to.
        room_id: RoomId,
        /// Matching persisted envelopes, in store order.
        messages: Vec<PostEnvelope>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    fn room(raw: &str) -> RoomId {
        RoomId::parse(raw).unwrap()
    }

    #[test]
    fn get_time_accepts_both_spellings() {
        let snake: ClientMessage =
            serde_json::from_str(r#"{"type":"get time","client_time":42}"#).unwrap();
        let camel: ClientMessage =
            serde_json::from_str(r#"{"type":"get time","clientTime":42}"#).unwrap();
        assert_eq!(snake, ClientMessage::GetTime { client_time: 42 });
        assert_eq!(camel, snake);
    }

    #[test]
    fn invalid_room_id_fails_decoding() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"watch","room_id":"xyz"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_type_fails_decoding() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"shout","room_id":"ab"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn post_broadcast_shape() {
        let envelope = PostEnvelope {
            room_id: room("a1"),
            message: StampedMessage {
                data: json!("up-pressed"),
                time: 1000,
                server_received_at: 1005,
            },
        };
        let encoded = serde_json::to_value(ServerMessage::Post(envelope)).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "post",
                "room_id": "a1",
                "message": {"data": "up-pressed", "time": 1000, "server_received_at": 1005}
            })
        );
    }

    #[test]
    fn inform_time_reads_camel_case_field() {
        let decoded: ServerMessage =
            serde_json::from_str(r#"{"type":"inform time","serverTime":99}"#).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::InformTime {
                server_time: 99,
                client_time: None
            }
        );
    }

    #[test]
    fn resync_response_carries_envelopes() {
        let raw = r#"{
            "type": "resync-response",
            "room_id": "ff",
            "messages": [
                {"type": "post", "room_id": "ff",
                 "message": {"data": 1, "time": 3, "server_received_at": 4}}
            ]
        }"#;
        let decoded: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::ResyncResponse { room_id, messages } = decoded else {
            panic!("expected resync-response");
        };
        assert_eq!(room_id, room("ff"));
        assert_eq!(messages.len(), 1);
        let event = messages.into_iter().next().unwrap().message.into_event();
        assert_eq!(event, TimelineEvent::confirmed(json!(1), 3, 4));
    }

    #[test]
    fn since_matches_either_timestamp() {
        let envelope = PostEnvelope {
            room_id: room("ab"),
            message: StampedMessage {
                data: json!(null),
                time: 100,
                server_received_at: 500,
            },
        };
        assert!(envelope.matches_since(100));
        assert!(envelope.matches_since(400));
        assert!(envelope.matches_since(500));
        assert!(!envelope.matches_since(501));
    }
}
