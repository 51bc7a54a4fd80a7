//! Error codes carried by `*_error` events.
//!
//! The server sends these as `"SCREAMING_SNAKE_CASE"` strings (e.g.
//! `"LOBBY_NOT_FOUND"`). Codes this client does not know are preserved in
//! [`ErrorCode::Unknown`] instead of failing the whole frame.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes returned by the platform server.
///
/// [`ErrorCode::Kicked`] is distinguished: receiving it forces a hard reset of
/// the lobby state regardless of what was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    // Lobby membership
    Kicked,
    LobbyNotFound,
    LobbyFull,
    AlreadyInLobby,
    NotInLobby,
    NotHost,
    InvalidSettings,
    NotAllReady,
    GameNotSelected,

    // Game
    NoActiveGame,
    NotYourTurn,
    InvalidMove,
    GameAlreadyStarted,

    // Social
    FriendNotFound,

    // Platform
    RateLimited,
    Unauthorized,
    InternalError,

    /// A code this client version does not recognize, kept verbatim.
    Unknown(String),
}

impl ErrorCode {
    /// The wire representation of this code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Kicked => "KICKED",
            Self::LobbyNotFound => "LOBBY_NOT_FOUND",
            Self::LobbyFull => "LOBBY_FULL",
            Self::AlreadyInLobby => "ALREADY_IN_LOBBY",
            Self::NotInLobby => "NOT_IN_LOBBY",
            Self::NotHost => "NOT_HOST",
            Self::InvalidSettings => "INVALID_SETTINGS",
            Self::NotAllReady => "NOT_ALL_READY",
            Self::GameNotSelected => "GAME_NOT_SELECTED",
            Self::NoActiveGame => "NO_ACTIVE_GAME",
            Self::NotYourTurn => "NOT_YOUR_TURN",
            Self::InvalidMove => "INVALID_MOVE",
            Self::GameAlreadyStarted => "GAME_ALREADY_STARTED",
            Self::FriendNotFound => "FRIEND_NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns `true` for the code that forces an unconditional lobby reset.
    pub fn is_kicked(&self) -> bool {
        matches!(self, Self::Kicked)
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &str {
        match self {
            Self::Kicked => "You were removed from the lobby by the host.",
            Self::LobbyNotFound => {
                "The lobby could not be found. It may have closed or the code is incorrect."
            }
            Self::LobbyFull => "The lobby has reached its player capacity.",
            Self::AlreadyInLobby => "You are already in a lobby. Leave it before joining another.",
            Self::NotInLobby => "You are not currently in a lobby.",
            Self::NotHost => "Only the lobby host can do that.",
            Self::InvalidSettings => "The requested lobby settings are not allowed.",
            Self::NotAllReady => "Every member must be ready before the game can start.",
            Self::GameNotSelected => "Select a game before starting.",
            Self::NoActiveGame => "There is no active game for this lobby.",
            Self::NotYourTurn => "Wait for your turn.",
            Self::InvalidMove => "That move is not allowed.",
            Self::GameAlreadyStarted => "The game has already started.",
            Self::FriendNotFound => "That user is not on your friends list.",
            Self::RateLimited => "Too many requests in a short time. Please slow down.",
            Self::Unauthorized => "Your session is not authorized. Sign in again.",
            Self::InternalError => "The server hit an internal error. Please try again.",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<String> for ErrorCode {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "KICKED" => Self::Kicked,
            "LOBBY_NOT_FOUND" => Self::LobbyNotFound,
            "LOBBY_FULL" => Self::LobbyFull,
            "ALREADY_IN_LOBBY" => Self::AlreadyInLobby,
            "NOT_IN_LOBBY" => Self::NotInLobby,
            "NOT_HOST" => Self::NotHost,
            "INVALID_SETTINGS" => Self::InvalidSettings,
            "NOT_ALL_READY" => Self::NotAllReady,
            "GAME_NOT_SELECTED" => Self::GameNotSelected,
            "NO_ACTIVE_GAME" => Self::NoActiveGame,
            "NOT_YOUR_TURN" => Self::NotYourTurn,
            "INVALID_MOVE" => Self::InvalidMove,
            "GAME_ALREADY_STARTED" => Self::GameAlreadyStarted,
            "FRIEND_NOT_FOUND" => Self::FriendNotFound,
            "RATE_LIMITED" => Self::RateLimited,
            "UNAUTHORIZED" => Self::Unauthorized,
            "INTERNAL_ERROR" => Self::InternalError,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_owned())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Unknown(raw) => raw,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::LobbyNotFound).unwrap();
        assert_eq!(json, "\"LOBBY_NOT_FOUND\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::LobbyNotFound);
    }

    #[test]
    fn unknown_code_is_preserved() {
        let code: ErrorCode = serde_json::from_str("\"SEASON_LOCKED\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown("SEASON_LOCKED".into()));
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"SEASON_LOCKED\"");
    }

    #[test]
    fn only_kicked_forces_reset() {
        assert!(ErrorCode::Kicked.is_kicked());
        assert!(!ErrorCode::NotHost.is_kicked());
        assert!(!ErrorCode::Unknown("KICK".into()).is_kicked());
    }

    #[test]
    fn display_uses_description() {
        assert_eq!(
            ErrorCode::NotHost.to_string(),
            "Only the lobby host can do that."
        );
    }
}
