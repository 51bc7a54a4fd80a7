//! Events surfaced to the UI.
//!
//! [`LobbyLinkEvent`] is the type delivered on the bounded channel returned by
//! [`LobbyLinkClient::start`](crate::LobbyLinkClient::start). Continuous state
//! (lobby, game, chat, presence) is published separately through watch
//! receivers; events are for things that happen once: a navigation, a kick, an
//! error to toast, a message that just arrived.

use crate::channel::ChannelStatus;
use crate::coordinator::Route;
use crate::protocol::chat::FriendRequest;
use crate::protocol::game::GameResult;
use crate::protocol::lobby::LobbyMessage;
use crate::protocol::UserId;
use crate::state::{ChatMessage, LobbyError};

/// Notable occurrences emitted by the client loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyLinkEvent {
    /// Connection status of a channel changed.
    Connection {
        channel: String,
        status: ChannelStatus,
    },

    /// The UI should switch screens.
    Navigate(Route),

    // ── Lobby ───────────────────────────────────────────────────────
    /// A create or join was confirmed by the server.
    LobbyEntered { lobby_code: String },
    /// The local user left the lobby.
    LobbyLeft { lobby_code: Option<String> },
    /// The local user was removed from the lobby. The lobby state has already
    /// been reset.
    Kicked {
        lobby_code: Option<String>,
        message: String,
    },
    /// The server rejected a lobby request.
    LobbyError(LobbyError),
    /// A lobby chat line arrived.
    LobbyMessage(LobbyMessage),

    /// No reply arrived for a request within the request timeout.
    RequestTimedOut {
        channel: &'static str,
        request: &'static str,
    },

    // ── Game ────────────────────────────────────────────────────────
    GameStarted {
        lobby_code: String,
        game_name: String,
    },
    MoveApplied { player_id: UserId },
    GameEnded {
        result: GameResult,
        winner_id: Option<UserId>,
    },
    PlayerForfeited {
        player_id: UserId,
        winner_id: Option<UserId>,
    },
    /// The server rejected a game request.
    GameError { message: String },

    // ── Chat and friends ────────────────────────────────────────────
    /// A direct message from a friend.
    ChatMessage {
        friend_id: UserId,
        message: ChatMessage,
    },
    /// A history page could not be fetched.
    ChatHistoryFailed { friend_id: UserId, message: String },
    FriendRequest(FriendRequest),
    FriendRemoved { user_id: UserId },

    /// The client loop has stopped. Always the last event.
    Disconnected { reason: Option<String> },
}
