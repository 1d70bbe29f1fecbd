//! Command-line participant for Lockstep rooms.
//!
//! ```text
//! lockstep                              probe the server clock
//! lockstep post <room_id> <data>...     post one event
//! lockstep watch <room_id>              print the room ledger as it grows
//! lockstep play <room_id> [--game ..]   render a demo game from the room
//! ```
//!
//! The server address and timing knobs come from environment variables,
//! see [`config::ClientConfig::from_env`].

mod config;
mod connection;
mod error;
mod games;
mod post;
mod probe;
mod watch;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use lockstep_core::{ReplayEngine, Session, Simulation};
use lockstep_types::{RoomId, TimelineEvent};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::games::GameKind;

/// Lockstep room client.
#[derive(Debug, Parser)]
#[command(name = "lockstep", version, about)]
struct Cli {
    /// Command to run; probes the server clock when omitted.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Post one event to a room.
    Post {
        /// Target room (hex identifier).
        room_id: RoomId,
        /// Payload words, joined with spaces into a JSON string.
        #[arg(required = true, num_args = 1..)]
        data: Vec<String>,
        /// Parse the payload as raw JSON instead.
        #[arg(long)]
        json: bool,
    },
    /// Watch a room and print its ordered ledger after each change.
    Watch {
        /// Room to watch.
        room_id: RoomId,
    },
    /// Watch a room and render a demo game from its events.
    Play {
        /// Room to watch.
        room_id: RoomId,
        /// Which game to render.
        #[arg(long, value_enum, default_value_t = GameKind::Lane)]
        game: GameKind,
    },
}

/// Replay logic for `watch`, which only prints the ledger: counts events.
#[derive(Debug, Clone, Copy)]
struct EventCount;

impl Simulation for EventCount {
    type State = u64;

    fn apply(&self, count: u64, _event: &TimelineEvent) -> u64 {
        count.saturating_add(1)
    }

    fn tick(&self, count: u64) -> u64 {
        count
    }
}

async fn dispatch(cli: Cli, config: ClientConfig) -> Result<(), ClientError> {
    match cli.command {
        None => probe::run(&config).await,
        Some(Command::Post {
            room_id,
            data,
            json,
        }) => {
            let payload = post::parse_payload(&data, json)?;
            post::run(&config, room_id, payload).await
        }
        Some(Command::Watch { room_id }) => {
            let session = Session::new(ReplayEngine::new(EventCount, 0, 0));
            watch::run(config, room_id, session).await
        }
        Some(Command::Play { room_id, game }) => games::play(config, room_id, game).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(server_url = config.server_url, "configuration loaded");

    match dispatch(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
