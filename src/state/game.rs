//! Turn-based game reconciliation.
//!
//! The server is the only rules authority: the engine never computes a board.
//! It gates move proposals (turn, in-flight move, optional legality pre-check),
//! replaces its snapshot wholesale from every server reply, derives the turn
//! countdown from the server's `turn_start_time`, and recovers from the
//! "no active game" race by creating the game (host) or polling for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::pending::{PendingRequests, RequestKind};
use super::timers::{TimerDomain, TimerKey, TimerRegistry};
use super::{Now, Step};
use crate::error::{LobbyLinkError, Result};
use crate::error_codes::ErrorCode;
use crate::protocol::game::{GameResult, GameState};
use crate::protocol::{GameClientEvent, GameServerEvent, UserId};

pub type GameStep = Step<GameClientEvent, GameNotice>;

const TURN_CLOCK_PERIOD: Duration = Duration::from_secs(1);
const TURN_CLOCK_ID: &str = "turn";
const RESYNC_POLL_ID: &str = "poll";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GamePhase {
    #[default]
    Idle,
    /// `get_game_state` or `create_game` sent, no snapshot yet.
    AwaitingState,
    InProgress,
    Ended,
}

/// What the engine knows about the surrounding lobby.
#[derive(Debug, Clone, PartialEq)]
pub struct GameContext {
    pub lobby_code: String,
    pub game_name: Option<String>,
    pub game_rules: Option<Value>,
    pub is_host: bool,
}

/// Read-only copy of the engine published to observers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameView {
    pub phase: GamePhase,
    pub context: Option<GameContext>,
    pub state: Option<GameState>,
    pub move_in_flight: bool,
    /// Whole seconds left in the current turn, never negative.
    pub turn_remaining_secs: Option<u64>,
    pub is_my_turn: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameNotice {
    Started { lobby_code: String, game_name: String },
    MoveApplied { player_id: UserId },
    Ended {
        result: GameResult,
        winner_id: Option<UserId>,
    },
    Forfeited {
        player_id: UserId,
        winner_id: Option<UserId>,
    },
    Error { message: String },
    TimedOut { request: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameRequest {
    Start,
    Move,
    Forfeit,
}

impl RequestKind for GameRequest {
    fn name(self) -> &'static str {
        match self {
            Self::Start => "create_game",
            Self::Move => "make_move",
            Self::Forfeit => "forfeit",
        }
    }

    fn resolved_by(self) -> &'static [&'static str] {
        match self {
            Self::Start => &["game_started", "game_state"],
            Self::Move => &["game_state", "game_ended"],
            Self::Forfeit => &["player_forfeited", "game_ended"],
        }
    }
}

/// Client-side legality pre-check for one game.
///
/// Only saves obviously illegal round-trips; the server still decides.
pub trait MoveValidator: Send + Sync {
    /// Return a human-readable reason if `move_data` is certainly illegal.
    fn check(&self, state: &GameState, move_data: &Value) -> std::result::Result<(), String>;
}

/// Tic-tac-toe: a nine-cell `board`, moves carry a `position` in `0..=8`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicTacToe;

impl MoveValidator for TicTacToe {
    fn check(&self, state: &GameState, move_data: &Value) -> std::result::Result<(), String> {
        let position = move_data
            .get("position")
            .and_then(Value::as_u64)
            .ok_or_else(|| "move needs a numeric `position`".to_owned())?;
        let index = usize::try_from(position)
            .ok()
            .filter(|p| *p < 9)
            .ok_or_else(|| format!("position {position} is off the board"))?;
        let Some(board) = state.field("board").and_then(Value::as_array) else {
            return Ok(());
        };
        if board.len() != 9 {
            return Err(format!("expected 9 cells, board has {}", board.len()));
        }
        match board.get(index) {
            Some(Value::Null) => Ok(()),
            Some(Value::String(cell)) if cell.is_empty() => Ok(()),
            _ => Err(format!("cell {position} is taken")),
        }
    }
}

/// Remaining turn time: `max(0, timeout - (now - start))`.
///
/// A start time in the future (clock skew) counts as no time elapsed.
pub fn turn_remaining(state: &GameState, now: DateTime<Utc>) -> Option<Duration> {
    let start = state.turn_start_time?;
    let timeout = Duration::from_secs(u64::from(state.turn_timeout_seconds?));
    let elapsed = (now - start).to_std().unwrap_or(Duration::ZERO);
    Some(timeout.saturating_sub(elapsed))
}

pub struct GameEngine {
    local_user_id: UserId,
    resync_interval: Duration,
    validators: HashMap<String, Arc<dyn MoveValidator>>,
    phase: GamePhase,
    context: Option<GameContext>,
    state: Option<GameState>,
    pending: PendingRequests<GameRequest>,
    /// Set once the host has auto-created a game in this awaiting phase.
    auto_created: bool,
    /// Phase and auto-create flag to restore if `create_game` is refused.
    before_start: Option<(GamePhase, bool)>,
    turn_remaining: Option<Duration>,
    last_error: Option<String>,
}

impl GameEngine {
    /// An engine with the built-in tic-tac-toe validator registered.
    pub fn new(local_user_id: impl Into<UserId>, resync_interval: Duration) -> Self {
        let mut validators: HashMap<String, Arc<dyn MoveValidator>> = HashMap::new();
        validators.insert("tictactoe".to_owned(), Arc::new(TicTacToe));
        Self {
            local_user_id: local_user_id.into(),
            resync_interval,
            validators,
            phase: GamePhase::Idle,
            context: None,
            state: None,
            pending: PendingRequests::new(),
            auto_created: false,
            before_start: None,
            turn_remaining: None,
            last_error: None,
        }
    }

    /// Register or replace the validator for `game_name`.
    pub fn register_validator(&mut self, game_name: impl Into<String>, validator: Arc<dyn MoveValidator>) {
        self.validators.insert(game_name.into(), validator);
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn state(&self) -> Option<&GameState> {
        self.state.as_ref()
    }

    pub fn context(&self) -> Option<&GameContext> {
        self.context.as_ref()
    }

    pub fn is_my_turn(&self) -> bool {
        self.phase == GamePhase::InProgress
            && self
                .state
                .as_ref()
                .and_then(|s| s.current_turn.as_deref())
                == Some(self.local_user_id.as_str())
    }

    pub fn view(&self) -> GameView {
        GameView {
            phase: self.phase,
            context: self.context.clone(),
            state: self.state.clone(),
            move_in_flight: self.pending.is_pending(GameRequest::Move),
            turn_remaining_secs: self.turn_remaining.map(|d| d.as_secs()),
            is_my_turn: self.is_my_turn(),
            last_error: self.last_error.clone(),
        }
    }

    /// Update the lobby context. Only host flag and game choice change here;
    /// the snapshot is left alone.
    pub fn set_context(&mut self, context: Option<GameContext>) {
        self.context = context;
    }

    // ── Intents ─────────────────────────────────────────────────────

    /// Start following the game: ask for the current state.
    pub fn enter(&mut self) -> GameStep {
        if self.phase != GamePhase::InProgress {
            self.phase = GamePhase::AwaitingState;
        }
        self.auto_created = false;
        Step::emit(GameClientEvent::GetGameState {})
    }

    /// Re-request full state after a suspected desync.
    pub fn resync(&mut self) -> GameStep {
        if self.phase == GamePhase::Idle {
            self.phase = GamePhase::AwaitingState;
        }
        Step::emit(GameClientEvent::GetGameState {})
    }

    /// Host only: ask the server to create the game for the lobby.
    pub fn start_game(&mut self, now: Now) -> Result<GameStep> {
        let context = self.context.as_ref().ok_or(LobbyLinkError::NotInLobby)?;
        if !context.is_host {
            return Err(LobbyLinkError::NotHost);
        }
        let game_name = context
            .game_name
            .clone()
            .ok_or(LobbyLinkError::NotReadyToStart("no game selected"))?;
        if self.phase == GamePhase::InProgress {
            return Err(LobbyLinkError::NotReadyToStart("a game is already running"));
        }
        let rules = context.game_rules.clone();
        self.pending.begin(GameRequest::Start, now.instant)?;
        self.before_start = Some((self.phase, self.auto_created));
        self.phase = GamePhase::AwaitingState;
        self.auto_created = true;
        info!(%game_name, "starting game");
        Ok(Step::emit(GameClientEvent::CreateGame { game_name, rules }))
    }

    /// Propose a move. The snapshot only changes when the server replies.
    pub fn propose_move(&mut self, move_data: Value, now: Now) -> Result<GameStep> {
        if self.phase != GamePhase::InProgress {
            return Err(LobbyLinkError::NotInGame);
        }
        let state = self.state.as_ref().ok_or(LobbyLinkError::NotInGame)?;
        if state.current_turn.as_deref() != Some(self.local_user_id.as_str()) {
            return Err(LobbyLinkError::NotYourTurn);
        }
        if self.pending.is_pending(GameRequest::Move) {
            return Err(LobbyLinkError::MoveInFlight);
        }
        let validator = self
            .context
            .as_ref()
            .and_then(|c| c.game_name.as_deref())
            .and_then(|name| self.validators.get(name));
        if let Some(validator) = validator {
            validator
                .check(state, &move_data)
                .map_err(LobbyLinkError::IllegalMove)?;
        }
        self.pending.begin(GameRequest::Move, now.instant)?;
        Ok(Step::emit(GameClientEvent::MakeMove { move_data }))
    }

    pub fn forfeit(&mut self, now: Now) -> Result<GameStep> {
        if self.phase != GamePhase::InProgress {
            return Err(LobbyLinkError::NotInGame);
        }
        self.pending.begin(GameRequest::Forfeit, now.instant)?;
        Ok(Step::emit(GameClientEvent::Forfeit {}))
    }

    // ── Server events ───────────────────────────────────────────────

    pub fn apply(&mut self, event: GameServerEvent, now: Now, timers: &mut TimerRegistry) -> GameStep {
        if self.phase == GamePhase::Idle && self.context.is_none() {
            debug!(?event, "dropping game event outside any lobby");
            return Step::none();
        }
        match event {
            GameServerEvent::GameStarted {
                lobby_code,
                game_name,
                game_state,
            } => {
                if let Some(context) = &self.context {
                    if context.lobby_code != lobby_code {
                        debug!(%lobby_code, "ignoring game_started of another lobby");
                        return Step::none();
                    }
                }
                info!(%lobby_code, %game_name, "game started");
                self.pending.resolve_on("game_started");
                self.install(game_state, now, timers);
                Step::notice(GameNotice::Started {
                    lobby_code,
                    game_name,
                })
            }
            GameServerEvent::MoveMade {
                player_id,
                game_state,
                ..
            } => {
                if self.state.is_none() {
                    debug!("move_made without a snapshot, resyncing");
                    return self.resync();
                }
                if player_id == self.local_user_id {
                    self.pending.resolve(GameRequest::Move);
                }
                self.install(game_state, now, timers);
                Step::notice(GameNotice::MoveApplied { player_id })
            }
            GameServerEvent::GameState {
                game_state: Some(game_state),
                ..
            } => {
                self.pending.resolve_on("game_state");
                self.install(game_state, now, timers);
                Step::none()
            }
            GameServerEvent::GameState {
                game_state: None, ..
            } => self.no_active_game(now, timers),
            GameServerEvent::GameEnded {
                result,
                winner_id,
                game_state,
            } => {
                self.pending.clear();
                self.install(game_state, now, timers);
                self.finish(timers);
                Step::notice(GameNotice::Ended { result, winner_id })
            }
            GameServerEvent::PlayerForfeited {
                player_id,
                winner_id,
                game_state,
            } => {
                self.pending.clear();
                self.install(game_state, now, timers);
                self.finish(timers);
                Step::notice(GameNotice::Forfeited {
                    player_id,
                    winner_id,
                })
            }
            GameServerEvent::GameError { error, details } => {
                if is_no_active_game(&error, details.as_ref()) {
                    return self.no_active_game(now, timers);
                }
                warn!(?details, "game error: {error}");
                self.pending.clear();
                self.last_error = Some(error.clone());
                Step::notice(GameNotice::Error { message: error })
            }
        }
    }

    /// Replace the snapshot and re-derive phase and clock from it.
    fn install(&mut self, state: GameState, now: Now, timers: &mut TimerRegistry) {
        let restarted = self
            .state
            .as_ref()
            .map_or(true, |old| old.turn_start_time != state.turn_start_time);
        timers.cancel(&TimerKey::new(TimerDomain::GameResync, RESYNC_POLL_ID));

        if state.is_terminal() {
            self.state = Some(state);
            self.finish(timers);
            return;
        }

        if restarted && state.turn_start_time.is_some() {
            timers.schedule_repeating(
                TimerKey::new(TimerDomain::TurnClock, TURN_CLOCK_ID),
                TURN_CLOCK_PERIOD,
                now.instant,
            );
        }
        self.turn_remaining = turn_remaining(&state, now.wall);
        self.state = Some(state);
        self.phase = GamePhase::InProgress;
        self.auto_created = false;
        self.before_start = None;
        self.last_error = None;
    }

    fn finish(&mut self, timers: &mut TimerRegistry) {
        self.phase = GamePhase::Ended;
        self.turn_remaining = None;
        timers.cancel(&TimerKey::new(TimerDomain::TurnClock, TURN_CLOCK_ID));
        timers.cancel(&TimerKey::new(TimerDomain::GameResync, RESYNC_POLL_ID));
    }

    fn no_active_game(&mut self, now: Now, timers: &mut TimerRegistry) -> GameStep {
        self.pending.resolve(GameRequest::Start);
        if !matches!(self.phase, GamePhase::AwaitingState | GamePhase::InProgress) {
            debug!(phase = ?self.phase, "no active game while not waiting for one");
            return Step::none();
        }
        self.phase = GamePhase::AwaitingState;
        self.state = None;
        self.turn_remaining = None;
        timers.cancel(&TimerKey::new(TimerDomain::TurnClock, TURN_CLOCK_ID));

        let create = self.context.as_ref().and_then(|c| {
            c.is_host
                .then(|| c.game_name.clone().map(|name| (name, c.game_rules.clone())))
                .flatten()
        });
        if let Some((game_name, rules)) = create.filter(|_| !self.auto_created) {
            self.before_start = Some((GamePhase::AwaitingState, false));
            self.auto_created = true;
            info!(%game_name, "no active game, creating it as host");
            if self.pending.begin(GameRequest::Start, now.instant).is_ok() {
                return Step::emit(GameClientEvent::CreateGame { game_name, rules });
            }
        }

        let poll = TimerKey::new(TimerDomain::GameResync, RESYNC_POLL_ID);
        if !timers.is_scheduled(&poll) {
            debug!(interval = ?self.resync_interval, "no active game, polling");
            timers.schedule_repeating(poll, self.resync_interval, now.instant);
        }
        Step::none()
    }

    // ── Timers and housekeeping ─────────────────────────────────────

    /// Handle a fired timer; returns what to emit.
    pub fn on_timer(&mut self, key: &TimerKey, now: Now, timers: &mut TimerRegistry) -> GameStep {
        match key.domain {
            TimerDomain::TurnClock => {
                self.turn_remaining = self
                    .state
                    .as_ref()
                    .and_then(|s| turn_remaining(s, now.wall));
                Step::none()
            }
            TimerDomain::GameResync => {
                if self.phase == GamePhase::AwaitingState {
                    Step::emit(GameClientEvent::GetGameState {})
                } else {
                    timers.cancel(key);
                    Step::none()
                }
            }
            TimerDomain::LobbyTyping | TimerDomain::ChatTyping => Step::none(),
        }
    }

    pub fn sweep(&mut self, now: Now, timeout: Duration) -> GameStep {
        let mut step = Step::none();
        for request in self.pending.sweep(now.instant, timeout) {
            warn!(request = request.name(), "game request timed out");
            step = step.with_notice(GameNotice::TimedOut {
                request: request.name(),
            });
        }
        step
    }

    /// Roll back an emit the channel refused. A refused `create_game` puts
    /// the phase back to where `start_game` found it.
    pub fn abort(&mut self, event: &GameClientEvent) {
        let request = match event {
            GameClientEvent::CreateGame { .. } => GameRequest::Start,
            GameClientEvent::MakeMove { .. } => GameRequest::Move,
            GameClientEvent::Forfeit {} => GameRequest::Forfeit,
            GameClientEvent::GetGameState {} => return,
        };
        self.pending.abandon(request);
        if request == GameRequest::Start {
            if let Some((phase, auto_created)) = self.before_start.take() {
                debug!(?phase, "create_game never sent, restoring phase");
                self.phase = phase;
                self.auto_created = auto_created;
            }
        }
    }

    /// Forget the game and stop its timers.
    pub fn reset(&mut self, timers: &mut TimerRegistry) {
        self.phase = GamePhase::Idle;
        self.state = None;
        self.pending.clear();
        self.auto_created = false;
        self.before_start = None;
        self.turn_remaining = None;
        self.last_error = None;
        timers.clear_domain(TimerDomain::TurnClock);
        timers.clear_domain(TimerDomain::GameResync);
    }
}

impl std::fmt::Debug for GameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameEngine")
            .field("phase", &self.phase)
            .field("context", &self.context)
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn is_no_active_game(error: &str, details: Option<&Value>) -> bool {
    let code = details
        .and_then(|d| d.get("code").or_else(|| d.get("error_code")))
        .and_then(Value::as_str)
        .map(ErrorCode::from);
    code == Some(ErrorCode::NoActiveGame) || error.to_ascii_lowercase().contains("no active game")
}
