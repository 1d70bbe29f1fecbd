//! One-shot `post` command.

use lockstep_core::{ClockSync, LocalClock, SystemClock};
use lockstep_types::{ClientMessage, PostMessage, RoomId, ServerMessage};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::connection::ServerConnection;
use crate::error::ClientError;
use crate::probe::{absorb_reply, probe_frame};

/// Build the event payload from command-line words.
///
/// Words are joined with single spaces into a JSON string, unless `raw_json`
/// is set, in which case the joined text is parsed as JSON.
pub fn parse_payload(words: &[String], raw_json: bool) -> Result<Value, ClientError> {
    let text = words.join(" ");
    if raw_json {
        Ok(serde_json::from_str(&text)?)
    } else {
        Ok(Value::String(text))
    }
}

/// Post `data` to `room_id`, stamped with the best available server time.
pub async fn run(config: &ClientConfig, room_id: RoomId, data: Value) -> Result<(), ClientError> {
    let clock = SystemClock;
    let mut conn = ServerConnection::connect(&config.server_url, config.connect_timeout).await?;
    let mut sync = ClockSync::new();

    conn.send(&probe_frame(&mut sync, &clock)).await?;
    let wait = tokio::time::timeout(config.post_clock_wait, await_estimate(&mut conn, &mut sync, &clock));
    match wait.await {
        Ok(result) => result?,
        Err(_elapsed) => warn!(
            wait_ms = u64::try_from(config.post_clock_wait.as_millis()).unwrap_or(u64::MAX),
            "no clock estimate in time, stamping with local time"
        ),
    }

    let time = sync.reference_now(&clock);
    info!(room_id = %room_id, time, "posting event");
    conn.send(&ClientMessage::Post {
        room_id,
        message: PostMessage { data, time },
    })
    .await?;
    conn.close().await
}

/// Read frames until one probe reply has been folded into `sync`.
async fn await_estimate(
    conn: &mut ServerConnection,
    sync: &mut ClockSync,
    clock: &dyn LocalClock,
) -> Result<(), ClientError> {
    loop {
        match conn.recv().await? {
            Some(ServerMessage::InformTime {
                server_time,
                client_time,
            }) => {
                if absorb_reply(sync, clock, server_time, client_time).is_some() {
                    return Ok(());
                }
            }
            Some(_) => {}
            None => return Err(ClientError::Closed),
        }
    }
}
