//! Game channel events.
//!
//! The game state blob is server-defined. Only the fields the client needs for
//! turn gating, countdowns and results are typed; everything else (the board,
//! scores, engine-specific keys) is kept verbatim in [`GameState::extra`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::UserId;

/// Terminal result of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    Win,
    Draw,
}

/// Authoritative game state as pushed by the server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameState {
    /// Player whose turn it is, if the game is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<UserId>,
    /// Player to symbol/colour assignment.
    #[serde(default)]
    pub players: BTreeMap<UserId, String>,
    /// Server instant the current turn began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_start_time: Option<DateTime<Utc>>,
    /// Seconds a player has for one turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_timeout_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GameResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<UserId>,
    /// Opaque remainder of the blob.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GameState {
    /// Returns `true` once the server has declared a result.
    pub fn is_terminal(&self) -> bool {
        self.result.is_some()
    }

    /// Look up an opaque field such as `board`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Events the client sends on the game channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum GameClientEvent {
    CreateGame {
        game_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rules: Option<Value>,
    },
    MakeMove {
        move_data: Value,
    },
    Forfeit {},
    GetGameState {},
}

/// Events the server pushes on the game channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum GameServerEvent {
    GameStarted {
        lobby_code: String,
        game_name: String,
        game_state: GameState,
    },
    MoveMade {
        lobby_code: String,
        player_id: UserId,
        move_data: Value,
        game_state: GameState,
    },
    GameState {
        #[serde(default)]
        game_state: Option<GameState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine_config: Option<Value>,
    },
    GameEnded {
        result: GameResult,
        #[serde(default)]
        winner_id: Option<UserId>,
        game_state: GameState,
    },
    PlayerForfeited {
        player_id: UserId,
        #[serde(default)]
        winner_id: Option<UserId>,
        game_state: GameState,
    },
    GameError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}
