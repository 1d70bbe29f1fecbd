//! Long-lived room watcher with reconnect and resync.
//!
//! A [`Watcher`] owns the room's [`Session`] for the whole process. Each
//! connection subscribes to the room, asks for everything since the
//! session's watermark, and then folds live posts in as they arrive. When
//! the connection drops the watcher sleeps for a bounded, doubling delay
//! and tries again; the session survives so the next resync only has to
//! cover the gap.
//!
//! ```text
//! connect ──> watch + resync(since) ──> live ──(drop)──> backoff ──┐
//!    ^                                                             │
//!    └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use lockstep_core::{ClockSync, Insertion, Session, Simulation, SystemClock};
use lockstep_types::{ClientMessage, RoomId, ServerMessage};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::ServerConnection;
use crate::error::ClientError;
use crate::probe::{absorb_reply, probe_frame};

/// Why the change callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The render interval elapsed.
    Timer,
    /// One or more events were inserted into the timeline.
    Inserted,
}

/// Doubling reconnect delay between a lower and an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `min`, never exceeding `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min.min(max),
        }
    }

    /// Delay to wait before the next attempt; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Go back to the minimum delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.min.min(self.max);
    }
}

/// How a connection ended.
enum Exit {
    Shutdown,
    Disconnected,
}

/// Watches one room for the lifetime of the process.
pub struct Watcher<S: Simulation> {
    config: ClientConfig,
    room_id: RoomId,
    session: Session<S>,
    sync: ClockSync,
    clock: SystemClock,
}

impl<S: Simulation> Watcher<S> {
    /// Create a watcher for `room_id` feeding `session`.
    pub fn new(config: ClientConfig, room_id: RoomId, session: Session<S>) -> Self {
        Self {
            config,
            room_id,
            session,
            sync: ClockSync::new(),
            clock: SystemClock,
        }
    }

    /// Watch until Ctrl-C.
    ///
    /// `on_change` receives the session, the current reference time and
    /// the reason it was called.
    pub async fn run<F>(self, on_change: F) -> Result<(), ClientError>
    where
        F: FnMut(&mut Session<S>, i64, Trigger),
    {
        let (shutdown_tx, shutdown) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received Ctrl-C, shutting down");
                    shutdown_tx.send_replace(true);
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    // Hold the sender so the receiver never reports closure.
                    std::future::pending::<()>().await;
                }
            }
        });
        self.run_until(shutdown, on_change).await
    }

    /// Watch until `shutdown` turns `true`.
    ///
    /// Connection attempts, backoff sleeps and live connections all stop
    /// as soon as the flag is raised; a live connection sends `unwatch`
    /// and closes first.
    pub async fn run_until<F>(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut on_change: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&mut Session<S>, i64, Trigger),
    {
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);
        let mut insertions = self.session.subscribe();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let attempt = tokio::select! {
                attempt = ServerConnection::connect(
                    &self.config.server_url,
                    self.config.connect_timeout,
                ) => attempt,
                Ok(()) = shutdown.changed() => continue,
            };
            match attempt {
                Ok(conn) => {
                    backoff.reset();
                    match self
                        .serve(conn, &mut shutdown, &mut insertions, &mut on_change)
                        .await
                    {
                        Ok(Exit::Shutdown) => return Ok(()),
                        Ok(Exit::Disconnected) => {
                            warn!(room_id = %self.room_id, "connection closed by server");
                        }
                        Err(e) => warn!(room_id = %self.room_id, error = %e, "connection lost"),
                    }
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "reconnecting");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                Ok(()) = shutdown.changed() => {}
            }
        }
    }

    /// Drive one connection until it drops or shutdown is requested.
    async fn serve<F>(
        &mut self,
        mut conn: ServerConnection,
        shutdown: &mut watch::Receiver<bool>,
        insertions: &mut broadcast::Receiver<Insertion>,
        on_change: &mut F,
    ) -> Result<Exit, ClientError>
    where
        F: FnMut(&mut Session<S>, i64, Trigger),
    {
        let since = self.session.watermark();
        conn.send(&ClientMessage::Watch {
            room_id: self.room_id.clone(),
        })
        .await?;
        conn.send(&ClientMessage::Resync {
            room_id: self.room_id.clone(),
            since,
        })
        .await?;
        info!(room_id = %self.room_id, since, "watching room");

        let mut probe = tokio::time::interval(self.config.probe_interval);
        let mut render = tokio::time::interval(self.config.render_interval);

        loop {
            tokio::select! {
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        conn.send(&ClientMessage::Unwatch {
                            room_id: self.room_id.clone(),
                        })
                        .await?;
                        conn.close().await?;
                        info!(room_id = %self.room_id, "unwatched room");
                        return Ok(Exit::Shutdown);
                    }
                }
                _ = probe.tick() => {
                    conn.send(&probe_frame(&mut self.sync, &self.clock)).await?;
                }
                _ = render.tick() => {
                    let now = self.sync.reference_now(&self.clock);
                    on_change(&mut self.session, now, Trigger::Timer);
                }
                frame = conn.recv() => match frame? {
                    Some(message) => self.absorb(message),
                    None => return Ok(Exit::Disconnected),
                },
                Ok(_) | Err(RecvError::Lagged(_)) = insertions.recv() => {
                    drain(insertions);
                    let now = self.sync.reference_now(&self.clock);
                    on_change(&mut self.session, now, Trigger::Inserted);
                }
            }
        }
    }

    /// Fold one server frame into the session or clock.
    fn absorb(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Post(envelope) if envelope.room_id == self.room_id => {
                let outcome = self.session.insert(envelope.message.into_event());
                debug!(index = outcome.index, inserted = outcome.inserted, "received post");
            }
            ServerMessage::ResyncResponse { room_id, messages } if room_id == self.room_id => {
                let received = messages.len();
                let summary = self
                    .session
                    .merge(messages.into_iter().map(|envelope| envelope.message.into_event()));
                info!(
                    room_id = %room_id,
                    received,
                    inserted = summary.inserted,
                    "resync merged"
                );
            }
            ServerMessage::InformTime {
                server_time,
                client_time,
            } => {
                absorb_reply(&mut self.sync, &self.clock, server_time, client_time);
            }
            ServerMessage::Post(_) | ServerMessage::ResyncResponse { .. } => {
                debug!("ignoring frame for another room");
            }
        }
    }
}

/// Discard queued notifications; one callback covers the whole burst.
fn drain(insertions: &mut broadcast::Receiver<Insertion>) {
    loop {
        match insertions.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

/// Print the room's ordered ledger after every insertion.
pub async fn run<S: Simulation>(
    config: ClientConfig,
    room_id: RoomId,
    session: Session<S>,
) -> Result<(), ClientError> {
    Watcher::new(config, room_id, session)
        .run(|session, _now, trigger| {
            if trigger != Trigger::Inserted {
                return;
            }
            match serde_json::to_string_pretty(session.timeline().events()) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "cannot render ledger"),
            }
        })
        .await
}
