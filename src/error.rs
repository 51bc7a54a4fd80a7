//! Error types for the LobbyLink client.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Errors that can occur when using the LobbyLink client.
#[derive(Debug, Error)]
pub enum LobbyLinkError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The channel has not been connected, or the shared connection is gone.
    #[error("channel `{0}` is not connected")]
    NotConnected(String),

    /// A lobby operation was attempted outside of a lobby.
    #[error("not in a lobby")]
    NotInLobby,

    /// `create_lobby`/`join_lobby` while already joining or inside a lobby.
    #[error("already in a lobby")]
    AlreadyInLobby,

    /// The same request kind is still waiting for its server reply.
    #[error("a `{0}` request is already in flight")]
    RequestPending(&'static str),

    /// Host-only operation attempted by a non-host member.
    #[error("only the lobby host can do that")]
    NotHost,

    /// The lobby does not satisfy the start conditions.
    #[error("lobby is not ready to start: {0}")]
    NotReadyToStart(&'static str),

    /// A game operation was attempted with no game in progress.
    #[error("no game in progress")]
    NotInGame,

    /// A move was proposed while another player holds the turn.
    #[error("it is not your turn")]
    NotYourTurn,

    /// A previous move has not been answered by the server yet.
    #[error("a move is already awaiting the server")]
    MoveInFlight,

    /// The client-side pre-check rejected a move.
    #[error("illegal move: {0}")]
    IllegalMove(String),

    /// The target user is not a member, or is the local user.
    #[error("`{0}` is not a valid target")]
    InvalidTarget(String),

    /// The referenced conversation is not known locally.
    #[error("unknown conversation `{0}`")]
    UnknownConversation(String),

    /// A chat message must carry text, an image, or both.
    #[error("message is empty")]
    EmptyMessage,

    /// The attachment request was rejected before reaching the server.
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),

    /// The server returned an error message.
    #[error("server error: {message}")]
    ServerError {
        /// Human-readable error message from the server.
        message: String,
        /// Structured error code, if provided by the server.
        error_code: Option<ErrorCode>,
    },

    /// A REST call was rejected with per-field validation messages.
    #[error("validation failed for {} field(s)", fields.len())]
    Validation {
        /// Field name to the message shown next to it.
        fields: BTreeMap<String, String>,
    },

    /// A REST call failed for a reason other than validation.
    #[error("http error: {0}")]
    Http(String),

    /// No reply arrived within the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// The background loop is gone (client shut down or dropped).
    #[error("client has shut down")]
    ClientClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "rest-api")]
impl From<reqwest::Error> for LobbyLinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err.to_string())
        }
    }
}

/// A specialized [`Result`] type for LobbyLink client operations.
pub type Result<T> = std::result::Result<T, LobbyLinkError>;
