//! Wire types for the multiplexed real-time connection.
//!
//! Every text frame on the shared connection is a [`Frame`]:
//!
//! ```json
//! {"channel": "lobby", "event": "join_lobby", "data": {"lobby_code": "K3F9QZ"}}
//! ```
//!
//! The per-channel modules define the typed events carried in `event`/`data`.
//! They are adjacently tagged enums, so a typed event converts to and from the
//! `(event, data)` pair with [`ChannelEvent::encode`] / [`ChannelEvent::decode`].

pub mod chat;
pub mod game;
pub mod lobby;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub use chat::{ChatClientEvent, ChatServerEvent};
pub use game::{GameClientEvent, GameServerEvent};
pub use lobby::{LobbyClientEvent, LobbyServerEvent};

/// Identifier the server assigns to a user. Always the `user_id` wire field.
pub type UserId = String;

/// Name of the lobby channel.
pub const LOBBY_CHANNEL: &str = "lobby";
/// Name of the game channel.
pub const GAME_CHANNEL: &str = "game";
/// Name of the chat/social channel.
pub const CHAT_CHANNEL: &str = "chat";

/// One frame on the shared connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Logical channel the frame belongs to.
    pub channel: String,
    /// Event name within that channel.
    pub event: String,
    /// Event payload. Missing or `null` is treated as an empty object.
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Build a frame, normalizing a `null` payload to `{}`.
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data: normalize(data),
        }
    }

    /// Parse a text frame received from the transport.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyLinkError::Serialization`](crate::LobbyLinkError::Serialization)
    /// if the text is not a frame.
    pub fn parse(text: &str) -> Result<Self> {
        let mut frame: Self = serde_json::from_str(text)?;
        frame.data = normalize(std::mem::take(&mut frame.data));
        Ok(frame)
    }

    /// Serialize the frame for the transport.
    ///
    /// # Errors
    ///
    /// Fails only if `data` contains a non-string map key, which `Value` cannot.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn normalize(data: Value) -> Value {
    match data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

/// A typed event that travels as an `(event, data)` pair.
pub trait ChannelEvent: Serialize + DeserializeOwned {
    /// Split into the wire event name and payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be represented.
    fn encode(&self) -> Result<(String, Value)> {
        let mut tagged = serde_json::to_value(self)?;
        let event = tagged
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_default();
        let data = tagged
            .as_object_mut()
            .and_then(|obj| obj.remove("data"))
            .unwrap_or(Value::Null);
        Ok((event, normalize(data)))
    }

    /// Rebuild the typed event from its wire name and payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for unknown events or malformed payloads.
    fn decode(event: &str, data: &Value) -> Result<Self> {
        let mut tagged = Map::new();
        tagged.insert("event".to_owned(), Value::String(event.to_owned()));
        tagged.insert("data".to_owned(), normalize(data.clone()));
        Ok(serde_json::from_value(Value::Object(tagged))?)
    }
}

impl ChannelEvent for LobbyClientEvent {}
impl ChannelEvent for LobbyServerEvent {}
impl ChannelEvent for GameClientEvent {}
impl ChannelEvent for GameServerEvent {}
impl ChannelEvent for ChatClientEvent {}
impl ChannelEvent for ChatServerEvent {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_without_data_decodes_as_empty_object() {
        let frame = Frame::parse(r#"{"channel":"lobby","event":"lobby_left"}"#).unwrap();
        assert_eq!(frame.data, json!({}));

        let frame = Frame::parse(r#"{"channel":"lobby","event":"lobby_left","data":null}"#).unwrap();
        assert_eq!(frame.data, json!({}));
    }

    #[test]
    fn encode_splits_event_and_data() {
        let (event, data) = LobbyClientEvent::JoinLobby {
            lobby_code: "K3F9QZ".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(event, "join_lobby");
        assert_eq!(data, json!({"lobby_code": "K3F9QZ"}));
    }

    #[test]
    fn empty_payload_events_encode_to_empty_object() {
        let (event, data) = GameClientEvent::GetGameState {}.encode().unwrap();
        assert_eq!(event, "get_game_state");
        assert_eq!(data, json!({}));
    }

    #[test]
    fn decode_rejects_unknown_event() {
        let err = LobbyServerEvent::decode("lobby_exploded", &json!({}));
        assert!(err.is_err());
    }

    #[test]
    fn decode_accepts_null_payload_for_empty_events() {
        let event = LobbyServerEvent::decode("lobby_left", &Value::Null).unwrap();
        assert!(matches!(event, LobbyServerEvent::LobbyLeft { .. }));
    }
}
