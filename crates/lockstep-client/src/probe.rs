//! Clock probing against the server.
//!
//! With no subcommand the client runs [`run`]: it probes the server once
//! per `PROBE_INTERVAL_MS` and prints every improvement of the offset
//! estimate until Ctrl-C. [`absorb_reply`] is shared with `post` and
//! `watch`, which probe in the background.

use lockstep_core::{ClockSync, LocalClock, ProbeOutcome, SystemClock};
use lockstep_types::{ClientMessage, ServerMessage};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::connection::ServerConnection;
use crate::error::ClientError;

/// Start a probe: remember the send time and build the frame.
pub fn probe_frame(sync: &mut ClockSync, clock: &dyn LocalClock) -> ClientMessage {
    ClientMessage::GetTime {
        client_time: sync.begin_probe(clock.now_millis()),
    }
}

/// Fold an `inform time` reply into `sync`, logging rejected replies.
pub fn absorb_reply(
    sync: &mut ClockSync,
    clock: &dyn LocalClock,
    server_time: i64,
    client_time: Option<i64>,
) -> Option<ProbeOutcome> {
    let received_at = clock.now_millis();
    match sync.complete_probe(client_time, server_time, received_at) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(error = %e, "discarding probe reply");
            None
        }
    }
}

/// Probe the server until Ctrl-C or disconnect, printing estimates.
pub async fn run(config: &ClientConfig) -> Result<(), ClientError> {
    let mut conn = ServerConnection::connect(&config.server_url, config.connect_timeout).await?;
    println!(
        "connected to {} - probing server time every {} ms",
        config.server_url,
        config.probe_interval.as_millis()
    );

    let clock = SystemClock;
    let mut sync = ClockSync::new();
    let mut interval = tokio::time::interval(config.probe_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                conn.send(&probe_frame(&mut sync, &clock)).await?;
            }
            frame = conn.recv() => {
                match frame? {
                    Some(ServerMessage::InformTime { server_time, client_time }) => {
                        let Some(outcome) =
                            absorb_reply(&mut sync, &clock, server_time, client_time)
                        else {
                            continue;
                        };
                        let estimate = sync.reference_now(&clock);
                        if outcome.improved {
                            println!(
                                "new best round trip: {} ms | server time {} | offset {} ms",
                                outcome.sample.round_trip_time, estimate, outcome.sample.offset
                            );
                        } else {
                            println!("estimated server time: {estimate}");
                        }
                    }
                    Some(_) => {}
                    None => {
                        println!("connection closed");
                        return Ok(());
                    }
                }
            }
            _ = &mut shutdown => {
                info!("received Ctrl-C, stopping probe");
                return conn.close().await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    /// Clock that advances by a fixed step on every read.
    struct SteppingClock {
        now: AtomicI64,
        step: i64,
    }

    impl LocalClock for SteppingClock {
        fn now_millis(&self) -> i64 {
            self.now.fetch_add(self.step, Ordering::SeqCst)
        }
    }

    #[test]
    fn probe_round_trip_updates_estimate() {
        let clock = SteppingClock {
            now: AtomicI64::new(1_000),
            step: 40,
        };
        let mut sync = ClockSync::new();

        let ClientMessage::GetTime { client_time } = probe_frame(&mut sync, &clock) else {
            panic!("expected get time");
        };
        assert_eq!(client_time, 1_000);

        // Received at 1040: rtt 40, midpoint 1020.
        let outcome = absorb_reply(&mut sync, &clock, 5_020, Some(client_time)).unwrap();
        assert!(outcome.improved);
        assert_eq!(outcome.sample.offset, 4_000);
    }
}
