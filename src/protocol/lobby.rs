//! Lobby channel events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::UserId;
use crate::error_codes::ErrorCode;

/// Whether the lobby is gathering players or has a game running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyStatus {
    #[default]
    Waiting,
    InGame,
}

/// A lobby member as the server reports it.
///
/// Older server builds key members by `identifier`; it is accepted on read
/// and always written back as `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    #[serde(alias = "identifier")]
    pub user_id: UserId,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_ready: bool,
}

/// Full lobby description pushed by `lobby_state`, `lobby_joined` and
/// `lobby_created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyInfo {
    pub lobby_code: String,
    pub host_id: UserId,
    pub max_players: u8,
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_rules: Option<Value>,
    #[serde(default)]
    pub members: Vec<MemberInfo>,
    #[serde(default)]
    pub current_players: u8,
    #[serde(default)]
    pub status: LobbyStatus,
}

/// Summary row of `public_lobbies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicLobby {
    pub lobby_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host_nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_name: Option<String>,
    pub current_players: u8,
    pub max_players: u8,
}

/// A lobby chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyMessage {
    pub id: String,
    pub lobby_code: String,
    #[serde(alias = "identifier")]
    pub user_id: UserId,
    pub nickname: String,
    pub content: String,
    pub created_at: String,
}

/// Events the client sends on the lobby channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LobbyClientEvent {
    CreateLobby {
        max_players: u8,
        is_public: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        game: Option<String>,
    },
    JoinLobby {
        lobby_code: String,
    },
    LeaveLobby {
        lobby_code: String,
    },
    UpdateSettings {
        max_players: u8,
        is_public: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    TransferHost {
        new_host_id: UserId,
    },
    KickMember {
        user_id: UserId,
    },
    ToggleReady {
        lobby_code: String,
    },
    SendLobbyMessage {
        lobby_code: String,
        content: String,
    },
    GetLobbyMessages {
        lobby_code: String,
        limit: u32,
    },
    GetPublicLobbies {},
    GetLobby {},
    SelectGame {
        lobby_code: String,
        game_name: String,
    },
    ClearGame {
        lobby_code: String,
    },
}

impl LobbyClientEvent {
    /// Wire name of this event, used for logging and request correlation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateLobby { .. } => "create_lobby",
            Self::JoinLobby { .. } => "join_lobby",
            Self::LeaveLobby { .. } => "leave_lobby",
            Self::UpdateSettings { .. } => "update_settings",
            Self::TransferHost { .. } => "transfer_host",
            Self::KickMember { .. } => "kick_member",
            Self::ToggleReady { .. } => "toggle_ready",
            Self::SendLobbyMessage { .. } => "send_lobby_message",
            Self::GetLobbyMessages { .. } => "get_lobby_messages",
            Self::GetPublicLobbies {} => "get_public_lobbies",
            Self::GetLobby {} => "get_lobby",
            Self::SelectGame { .. } => "select_game",
            Self::ClearGame { .. } => "clear_game",
        }
    }
}

/// Events the server pushes on the lobby channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LobbyServerEvent {
    LobbyCreated {
        lobby: LobbyInfo,
    },
    LobbyJoined {
        lobby: LobbyInfo,
    },
    LobbyLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lobby_code: Option<String>,
    },
    LobbyState(LobbyInfo),
    MemberJoined {
        member: MemberInfo,
        current_players: u8,
    },
    MemberLeft {
        #[serde(alias = "identifier")]
        user_id: UserId,
        nickname: String,
        current_players: u8,
    },
    HostTransferred {
        old_host_id: UserId,
        new_host_id: UserId,
        new_host_nickname: String,
    },
    SettingsUpdated {
        max_players: u8,
        is_public: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    MemberKicked {
        #[serde(alias = "identifier")]
        user_id: UserId,
        nickname: String,
        kicked_by_id: UserId,
    },
    MemberReadyChanged {
        #[serde(alias = "identifier")]
        user_id: UserId,
        nickname: String,
        is_ready: bool,
    },
    PublicLobbies {
        lobbies: Vec<PublicLobby>,
        total: u32,
    },
    LobbyMessage(LobbyMessage),
    LobbyMessagesHistory {
        messages: Vec<LobbyMessage>,
        lobby_code: String,
        total: u32,
    },
    LobbyUserTyping {
        #[serde(alias = "identifier")]
        user_id: UserId,
        nickname: String,
    },
    KickedFromLobby {
        lobby_code: String,
        message: String,
    },
    LobbyError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
}
