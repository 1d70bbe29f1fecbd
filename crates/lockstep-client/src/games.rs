//! Demo simulations rendered by `play`.
//!
//! Both games read the payloads `up-pressed`, `up-released`,
//! `down-pressed` and `down-released`; anything else leaves the state
//! unchanged.

use clap::ValueEnum;
use lockstep_core::{ReplayEngine, Session, Simulation};
use lockstep_types::{RoomId, TimelineEvent};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::watch::Watcher;

/// ANSI clear-screen and cursor-home sequence.
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// A simulation that can draw its own state.
pub trait Game: Simulation {
    /// State before any event.
    fn initial(&self) -> Self::State;

    /// Tick rate; zero disables ticking.
    fn ticks_per_second(&self) -> i64;

    /// Text to print for `state`.
    fn render(&self, state: &Self::State) -> String;
}

/// Which demo `play` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GameKind {
    /// One marker moving on a ten-row lane.
    Lane,
    /// A position that drifts while a direction is held.
    Ball,
}

fn key(event: &TimelineEvent) -> Option<&str> {
    event.data.as_str()
}

/// The lane game: `x` in `0..=9`, one step per press, no ticking.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lane;

impl Lane {
    /// Starting row.
    pub const START: u8 = 5;
    /// Last row.
    pub const LAST: u8 = 9;
}

impl Simulation for Lane {
    type State = u8;

    fn apply(&self, x: u8, event: &TimelineEvent) -> u8 {
        match key(event) {
            Some("up-pressed") => x.saturating_sub(1),
            Some("down-pressed") => x.saturating_add(1).min(Self::LAST),
            _ => x,
        }
    }

    fn tick(&self, x: u8) -> u8 {
        x
    }
}

impl Game for Lane {
    fn initial(&self) -> u8 {
        Self::START
    }

    fn ticks_per_second(&self) -> i64 {
        0
    }

    fn render(&self, x: &u8) -> String {
        let mut out = String::from(CLEAR_SCREEN);
        for row in 0..=Self::LAST {
            out.push_str(if row == *x { "X\n" } else { " \n" });
        }
        out
    }
}

/// State of the ball game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BallState {
    /// Current position.
    pub pos: i64,
    /// Up is held.
    pub up: bool,
    /// Down is held.
    pub down: bool,
}

/// The ball game: each tick moves `pos` by +1 while up is held and by -1
/// while down is held.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ball;

impl Simulation for Ball {
    type State = BallState;

    fn apply(&self, state: BallState, event: &TimelineEvent) -> BallState {
        match key(event) {
            Some("up-pressed") => BallState { up: true, ..state },
            Some("up-released") => BallState { up: false, ..state },
            Some("down-pressed") => BallState { down: true, ..state },
            Some("down-released") => BallState {
                down: false,
                ..state
            },
            _ => state,
        }
    }

    fn tick(&self, state: BallState) -> BallState {
        let pos = state
            .pos
            .saturating_add(i64::from(state.up))
            .saturating_sub(i64::from(state.down));
        BallState { pos, ..state }
    }
}

impl Game for Ball {
    fn initial(&self) -> BallState {
        BallState::default()
    }

    fn ticks_per_second(&self) -> i64 {
        24
    }

    fn render(&self, state: &BallState) -> String {
        format!("{}\n", state.pos)
    }
}

/// Watch `room_id` and redraw `kind` whenever its state changes.
pub async fn play(config: ClientConfig, room_id: RoomId, kind: GameKind) -> Result<(), ClientError> {
    match kind {
        GameKind::Lane => run_game(config, room_id, Lane).await,
        GameKind::Ball => run_game(config, room_id, Ball).await,
    }
}

async fn run_game<G: Game + Copy>(
    config: ClientConfig,
    room_id: RoomId,
    game: G,
) -> Result<(), ClientError> {
    let engine = ReplayEngine::new(game, game.initial(), game.ticks_per_second());
    let mut shown: Option<G::State> = None;
    Watcher::new(config, room_id, Session::new(engine))
        .run(|session, now, _trigger| {
            let state = session.state_at(now);
            if shown.as_ref() != Some(&state) {
                print!("{}", game.render(&state));
                shown = Some(state);
            }
        })
        .await
}
