//! Chat/social channel events and the companion REST payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// A direct message as the server stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Conversation row from `conversation_updated` or the summaries endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub friend_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<DirectMessage>,
}

/// A friend's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
    InLobby,
    InGame,
}

/// Full presence record for one user. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobby_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_name: Option<String>,
}

/// Incoming friend request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub request_id: String,
    pub from_user_id: UserId,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Events the client sends on the chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChatClientEvent {
    SendMessage {
        friend_user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_path: Option<String>,
    },
    Typing {
        friend_user_id: UserId,
    },
}

/// Events the server pushes on the chat channel.
///
/// The channel carries two unrelated streams; [`ChatServerEvent::route`]
/// separates them so each consumer only ever sees its own events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChatServerEvent {
    Message(DirectMessage),
    UserTyping {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },
    ConversationUpdated(ConversationSummary),
    FriendStatusUpdate(PresenceRecord),
    InitialFriendStatuses {
        statuses: Vec<PresenceRecord>,
    },
    FriendRequestReceived(FriendRequest),
    FriendRemoved {
        user_id: UserId,
    },
}

/// Chat-engine half of the chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    Message(DirectMessage),
    UserTyping { user_id: UserId },
    ConversationUpdated(ConversationSummary),
}

/// Presence half of the chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    InitialFriendStatuses(Vec<PresenceRecord>),
    FriendStatusUpdate(PresenceRecord),
}

/// Friend-relationship half of the chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FriendEvent {
    RequestReceived(FriendRequest),
    Removed { user_id: UserId },
}

/// A chat channel event addressed to exactly one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Conversation(ConversationEvent),
    Presence(PresenceEvent),
    Friends(FriendEvent),
}

impl ChatServerEvent {
    /// Split the event off to the consumer that owns it.
    pub fn route(self) -> Routed {
        match self {
            Self::Message(message) => Routed::Conversation(ConversationEvent::Message(message)),
            Self::UserTyping { user_id, .. } => {
                Routed::Conversation(ConversationEvent::UserTyping { user_id })
            }
            Self::ConversationUpdated(summary) => {
                Routed::Conversation(ConversationEvent::ConversationUpdated(summary))
            }
            Self::FriendStatusUpdate(record) => {
                Routed::Presence(PresenceEvent::FriendStatusUpdate(record))
            }
            Self::InitialFriendStatuses { statuses } => {
                Routed::Presence(PresenceEvent::InitialFriendStatuses(statuses))
            }
            Self::FriendRequestReceived(request) => {
                Routed::Friends(FriendEvent::RequestReceived(request))
            }
            Self::FriendRemoved { user_id } => Routed::Friends(FriendEvent::Removed { user_id }),
        }
    }
}

/// One page of conversation history, oldest message first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<DirectMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Signed upload target returned by the attachment endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    /// Where the caller PUTs the raw bytes.
    pub upload_url: String,
    /// Storage path to reference in `send_message`.
    pub image_path: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::protocol::ChannelEvent;
    use serde_json::json;

    #[test]
    fn social_events_never_reach_the_conversation_consumer() {
        let removed = ChatServerEvent::decode("friend_removed", &json!({"user_id": "u-3"})).unwrap();
        assert_eq!(
            removed.route(),
            Routed::Friends(FriendEvent::Removed {
                user_id: "u-3".into()
            })
        );

        let status = ChatServerEvent::decode(
            "friend_status_update",
            &json!({"user_id": "u-3", "status": "in_game", "game_name": "tictactoe"}),
        )
        .unwrap();
        assert!(matches!(
            status.route(),
            Routed::Presence(PresenceEvent::FriendStatusUpdate(PresenceRecord {
                status: PresenceStatus::InGame,
                ..
            }))
        ));

        let typing =
            ChatServerEvent::decode("user_typing", &json!({"user_id": "u-3", "nickname": "Cy"}))
                .unwrap();
        assert!(matches!(typing.route(), Routed::Conversation(_)));
    }

    #[test]
    fn message_decodes_with_image_only() {
        let event = ChatServerEvent::decode(
            "message",
            &json!({
                "id": "m-1",
                "sender_id": "u-2",
                "receiver_id": "u-1",
                "image_path": "chat/u-2/photo.png",
                "created_at": "2026-10-18T09:30:00Z"
            }),
        )
        .unwrap();
        let ChatServerEvent::Message(message) = event else {
            panic!("expected message");
        };
        assert!(message.content.is_none());
        assert_eq!(message.image_path.as_deref(), Some("chat/u-2/photo.png"));
    }

    #[test]
    fn send_message_omits_missing_parts() {
        let (_, data) = ChatClientEvent::SendMessage {
            friend_user_id: "u-2".into(),
            content: None,
            image_path: Some("chat/u-1/photo.png".into()),
        }
        .encode()
        .unwrap();
        assert_eq!(
            data,
            json!({"friend_user_id": "u-2", "image_path": "chat/u-1/photo.png"})
        );
    }
}
