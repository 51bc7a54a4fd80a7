//! Lobby lifecycle state machine.
//!
//! `Idle → Joining → InLobby → Idle`. Membership and settings are only ever
//! taken from server pushes; intents register a pending request and emit,
//! nothing more. Being kicked (by event or by the `KICKED` error code) resets
//! the machine to `Idle` whatever else is in flight.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::pending::{PendingRequests, RequestKind};
use super::timers::{TimerDomain, TimerKey, TimerRegistry};
use super::Step;
use crate::error::{LobbyLinkError, Result};
use crate::error_codes::ErrorCode;
use crate::protocol::lobby::{
    LobbyInfo, LobbyMessage, LobbyStatus, MemberInfo, PublicLobby,
};
use crate::protocol::{LobbyClientEvent, LobbyServerEvent, UserId};

pub type LobbyStep = Step<LobbyClientEvent, LobbyNotice>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LobbyPhase {
    #[default]
    Idle,
    /// A create or join request is waiting for the lobby snapshot.
    Joining,
    InLobby,
}

/// A lobby member. `is_host` is derived from the snapshot's `host_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: UserId,
    pub nickname: String,
    pub avatar_url: Option<String>,
    pub is_ready: bool,
    pub is_host: bool,
}

impl Member {
    fn from_info(info: MemberInfo, host_id: &str) -> Self {
        Self {
            is_host: info.user_id == host_id,
            user_id: info.user_id,
            nickname: info.nickname,
            avatar_url: info.avatar_url,
            is_ready: info.is_ready,
        }
    }
}

/// The current lobby. Member ids are unique.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbySnapshot {
    pub lobby_code: String,
    pub host_id: UserId,
    pub max_players: u8,
    pub is_public: bool,
    pub name: Option<String>,
    pub game_name: Option<String>,
    pub game_rules: Option<Value>,
    pub members: Vec<Member>,
    pub current_players: u8,
    pub status: LobbyStatus,
}

impl LobbySnapshot {
    fn from_info(info: LobbyInfo) -> Self {
        let mut snapshot = Self {
            lobby_code: info.lobby_code,
            host_id: info.host_id,
            max_players: info.max_players,
            is_public: info.is_public,
            name: info.name,
            game_name: info.game_name,
            game_rules: info.game_rules,
            members: Vec::with_capacity(info.members.len()),
            current_players: info.current_players,
            status: info.status,
        };
        for member in info.members {
            snapshot.upsert(member);
        }
        snapshot
    }

    /// Insert or replace by `user_id`, keeping the original position.
    fn upsert(&mut self, info: MemberInfo) {
        let member = Member::from_info(info, &self.host_id);
        match self.members.iter_mut().find(|m| m.user_id == member.user_id) {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
    }

    fn remove(&mut self, user_id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.user_id != user_id);
        self.members.len() != before
    }

    fn set_host(&mut self, host_id: UserId) {
        for member in &mut self.members {
            member.is_host = member.user_id == host_id;
        }
        self.host_id = host_id;
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// `true` when there is at least one member and every member is ready.
    pub fn all_members_ready(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(|m| m.is_ready)
    }

    pub fn is_full(&self) -> bool {
        self.current_players == self.max_players
    }
}

/// Domain error pushed by the server, kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyError {
    pub message: String,
    pub error_code: Option<ErrorCode>,
}

impl LobbyError {
    pub fn is_kicked(&self) -> bool {
        self.error_code.as_ref().is_some_and(ErrorCode::is_kicked)
    }
}

/// A lobby member currently typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingMember {
    pub user_id: UserId,
    pub nickname: String,
}

/// Read-only copy of the machine published to observers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LobbyView {
    pub phase: LobbyPhase,
    pub lobby: Option<LobbySnapshot>,
    /// `true` while any request is waiting for its reply.
    pub loading: bool,
    /// Wire names of the requests in flight.
    pub pending: Vec<&'static str>,
    /// Game chosen before a lobby exists, sent with `create_lobby`.
    pub draft_game: Option<String>,
    pub messages: Vec<LobbyMessage>,
    pub typing: Vec<TypingMember>,
    pub public_lobbies: Vec<PublicLobby>,
    pub public_total: u32,
    pub last_error: Option<LobbyError>,
    pub is_host: bool,
    pub all_members_ready: bool,
    pub can_start: bool,
}

/// Occurrences the UI should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyNotice {
    Entered { lobby_code: String },
    Left { lobby_code: Option<String> },
    /// The local user was removed. Always accompanied by a reset to `Idle`.
    Kicked {
        lobby_code: Option<String>,
        message: String,
    },
    Error(LobbyError),
    TimedOut { request: &'static str },
    Message(LobbyMessage),
}

/// Requests the lobby machine correlates with their replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyRequest {
    CreateLobby,
    JoinLobby,
    LeaveLobby,
    UpdateSettings,
    TransferHost,
    KickMember,
    ToggleReady,
    SendMessage,
    FetchMessages,
    FetchPublicLobbies,
    SelectGame,
}

impl RequestKind for LobbyRequest {
    fn name(self) -> &'static str {
        match self {
            Self::CreateLobby => "create_lobby",
            Self::JoinLobby => "join_lobby",
            Self::LeaveLobby => "leave_lobby",
            Self::UpdateSettings => "update_settings",
            Self::TransferHost => "transfer_host",
            Self::KickMember => "kick_member",
            Self::ToggleReady => "toggle_ready",
            Self::SendMessage => "send_lobby_message",
            Self::FetchMessages => "get_lobby_messages",
            Self::FetchPublicLobbies => "get_public_lobbies",
            Self::SelectGame => "select_game",
        }
    }

    fn resolved_by(self) -> &'static [&'static str] {
        match self {
            Self::CreateLobby => &["lobby_created", "lobby_joined", "lobby_state"],
            Self::JoinLobby => &["lobby_joined", "lobby_state"],
            Self::LeaveLobby => &["lobby_left"],
            Self::UpdateSettings => &["settings_updated", "lobby_state"],
            Self::TransferHost => &["host_transferred", "lobby_state"],
            Self::KickMember => &["member_kicked", "lobby_state"],
            Self::ToggleReady => &["lobby_state"],
            Self::SendMessage => &[],
            Self::FetchMessages => &["lobby_messages_history"],
            Self::FetchPublicLobbies => &["public_lobbies"],
            Self::SelectGame => &["lobby_state"],
        }
    }

    fn allows_concurrent(self) -> bool {
        matches!(self, Self::SendMessage)
    }
}

impl LobbyRequest {
    /// The request an outgoing event opens, if it expects a reply.
    pub fn started_by(event: &LobbyClientEvent) -> Option<Self> {
        match event {
            LobbyClientEvent::CreateLobby { .. } => Some(Self::CreateLobby),
            LobbyClientEvent::JoinLobby { .. } => Some(Self::JoinLobby),
            LobbyClientEvent::LeaveLobby { .. } => Some(Self::LeaveLobby),
            LobbyClientEvent::UpdateSettings { .. } => Some(Self::UpdateSettings),
            LobbyClientEvent::TransferHost { .. } => Some(Self::TransferHost),
            LobbyClientEvent::KickMember { .. } => Some(Self::KickMember),
            LobbyClientEvent::ToggleReady { .. } => Some(Self::ToggleReady),
            LobbyClientEvent::SendLobbyMessage { .. } => Some(Self::SendMessage),
            LobbyClientEvent::GetLobbyMessages { .. } => Some(Self::FetchMessages),
            LobbyClientEvent::GetPublicLobbies {} => Some(Self::FetchPublicLobbies),
            LobbyClientEvent::SelectGame { .. } | LobbyClientEvent::ClearGame { .. } => {
                Some(Self::SelectGame)
            }
            LobbyClientEvent::GetLobby {} => None,
        }
    }
}

#[derive(Debug)]
pub struct LobbyMachine {
    local_user_id: UserId,
    typing_expiry: Duration,
    phase: LobbyPhase,
    /// Code passed to `join_lobby`, to reject snapshots of other lobbies.
    joining_code: Option<String>,
    lobby: Option<LobbySnapshot>,
    pending: PendingRequests<LobbyRequest>,
    draft_game: Option<String>,
    messages: Vec<LobbyMessage>,
    typing: BTreeMap<UserId, String>,
    public_lobbies: Vec<PublicLobby>,
    public_total: u32,
    last_error: Option<LobbyError>,
}

impl LobbyMachine {
    pub fn new(local_user_id: impl Into<UserId>, typing_expiry: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            typing_expiry,
            phase: LobbyPhase::Idle,
            joining_code: None,
            lobby: None,
            pending: PendingRequests::new(),
            draft_game: None,
            messages: Vec::new(),
            typing: BTreeMap::new(),
            public_lobbies: Vec::new(),
            public_total: 0,
            last_error: None,
        }
    }

    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    pub fn lobby(&self) -> Option<&LobbySnapshot> {
        self.lobby.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_loading()
    }

    pub fn is_pending(&self, request: LobbyRequest) -> bool {
        self.pending.is_pending(request)
    }

    pub fn is_host(&self) -> bool {
        self.lobby
            .as_ref()
            .is_some_and(|l| l.host_id == self.local_user_id)
    }

    pub fn all_members_ready(&self) -> bool {
        self.lobby
            .as_ref()
            .is_some_and(LobbySnapshot::all_members_ready)
    }

    /// Host, everyone ready, lobby full, game selected, not already playing.
    pub fn can_start(&self) -> bool {
        self.check_start().is_ok()
    }

    /// Like [`can_start`](Self::can_start), naming the first unmet condition.
    ///
    /// # Errors
    ///
    /// `NotInLobby`, `NotHost` or `NotReadyToStart` with the reason.
    pub fn check_start(&self) -> Result<()> {
        let lobby = self.require_host()?;
        if lobby.game_name.is_none() {
            return Err(LobbyLinkError::NotReadyToStart("no game selected"));
        }
        if !lobby.all_members_ready() {
            return Err(LobbyLinkError::NotReadyToStart("not every member is ready"));
        }
        if !lobby.is_full() {
            return Err(LobbyLinkError::NotReadyToStart("lobby is not full"));
        }
        if lobby.status != LobbyStatus::Waiting {
            return Err(LobbyLinkError::NotReadyToStart("a game is already running"));
        }
        Ok(())
    }

    pub fn view(&self) -> LobbyView {
        LobbyView {
            phase: self.phase,
            lobby: self.lobby.clone(),
            loading: self.pending.is_loading(),
            pending: self.pending.kinds().into_iter().map(RequestKind::name).collect(),
            draft_game: self.draft_game.clone(),
            messages: self.messages.clone(),
            typing: self
                .typing
                .iter()
                .map(|(user_id, nickname)| TypingMember {
                    user_id: user_id.clone(),
                    nickname: nickname.clone(),
                })
                .collect(),
            public_lobbies: self.public_lobbies.clone(),
            public_total: self.public_total,
            last_error: self.last_error.clone(),
            is_host: self.is_host(),
            all_members_ready: self.all_members_ready(),
            can_start: self.can_start(),
        }
    }

    // ── Intents ─────────────────────────────────────────────────────

    /// Create a lobby. `game` falls back to the draft selection.
    pub fn create_lobby(
        &mut self,
        max_players: u8,
        is_public: bool,
        name: Option<String>,
        game: Option<String>,
        now: Instant,
    ) -> Result<LobbyStep> {
        self.require_idle()?;
        self.pending.begin(LobbyRequest::CreateLobby, now)?;
        self.phase = LobbyPhase::Joining;
        self.joining_code = None;
        self.last_error = None;
        Ok(Step::emit(LobbyClientEvent::CreateLobby {
            max_players,
            is_public,
            name,
            game: game.or_else(|| self.draft_game.clone()),
        }))
    }

    pub fn join_lobby(&mut self, lobby_code: &str, now: Instant) -> Result<LobbyStep> {
        self.require_idle()?;
        let lobby_code = lobby_code.trim();
        if lobby_code.is_empty() {
            return Err(LobbyLinkError::InvalidTarget(String::new()));
        }
        self.pending.begin(LobbyRequest::JoinLobby, now)?;
        self.phase = LobbyPhase::Joining;
        self.joining_code = Some(lobby_code.to_owned());
        self.last_error = None;
        Ok(Step::emit(LobbyClientEvent::JoinLobby {
            lobby_code: lobby_code.to_owned(),
        }))
    }

    pub fn leave_lobby(&mut self, now: Instant) -> Result<LobbyStep> {
        let lobby_code = self.require_lobby()?.lobby_code.clone();
        self.pending.begin(LobbyRequest::LeaveLobby, now)?;
        Ok(Step::emit(LobbyClientEvent::LeaveLobby { lobby_code }))
    }

    pub fn update_settings(
        &mut self,
        max_players: u8,
        is_public: bool,
        name: Option<String>,
        now: Instant,
    ) -> Result<LobbyStep> {
        self.require_host()?;
        self.pending.begin(LobbyRequest::UpdateSettings, now)?;
        Ok(Step::emit(LobbyClientEvent::UpdateSettings {
            max_players,
            is_public,
            name,
        }))
    }

    pub fn transfer_host(&mut self, target: &str, now: Instant) -> Result<LobbyStep> {
        self.require_other_member(target)?;
        self.pending.begin(LobbyRequest::TransferHost, now)?;
        Ok(Step::emit(LobbyClientEvent::TransferHost {
            new_host_id: target.to_owned(),
        }))
    }

    pub fn kick_member(&mut self, target: &str, now: Instant) -> Result<LobbyStep> {
        self.require_other_member(target)?;
        self.pending.begin(LobbyRequest::KickMember, now)?;
        Ok(Step::emit(LobbyClientEvent::KickMember {
            user_id: target.to_owned(),
        }))
    }

    pub fn toggle_ready(&mut self, now: Instant) -> Result<LobbyStep> {
        let lobby_code = self.require_lobby()?.lobby_code.clone();
        self.pending.begin(LobbyRequest::ToggleReady, now)?;
        Ok(Step::emit(LobbyClientEvent::ToggleReady { lobby_code }))
    }

    pub fn send_message(&mut self, text: &str, now: Instant) -> Result<LobbyStep> {
        let lobby_code = self.require_lobby()?.lobby_code.clone();
        let content = text.trim();
        if content.is_empty() {
            return Err(LobbyLinkError::EmptyMessage);
        }
        self.pending.begin(LobbyRequest::SendMessage, now)?;
        Ok(Step::emit(LobbyClientEvent::SendLobbyMessage {
            lobby_code,
            content: content.to_owned(),
        }))
    }

    pub fn fetch_messages(&mut self, limit: u32, now: Instant) -> Result<LobbyStep> {
        let lobby_code = self.require_lobby()?.lobby_code.clone();
        self.pending.begin(LobbyRequest::FetchMessages, now)?;
        Ok(Step::emit(LobbyClientEvent::GetLobbyMessages { lobby_code, limit }))
    }

    /// Allowed in any phase.
    pub fn fetch_public_lobbies(&mut self, now: Instant) -> Result<LobbyStep> {
        self.pending.begin(LobbyRequest::FetchPublicLobbies, now)?;
        Ok(Step::emit(LobbyClientEvent::GetPublicLobbies {}))
    }

    /// Outside a lobby this only updates the draft used by `create_lobby`;
    /// inside one the host asks the server to change the game.
    pub fn select_game(&mut self, game_name: &str, now: Instant) -> Result<LobbyStep> {
        match self.phase {
            LobbyPhase::Idle => {
                self.draft_game = Some(game_name.to_owned());
                Ok(Step::none())
            }
            LobbyPhase::Joining => Err(self.joining_error()),
            LobbyPhase::InLobby => {
                let lobby_code = self.require_host()?.lobby_code.clone();
                self.pending.begin(LobbyRequest::SelectGame, now)?;
                Ok(Step::emit(LobbyClientEvent::SelectGame {
                    lobby_code,
                    game_name: game_name.to_owned(),
                }))
            }
        }
    }

    pub fn clear_game_selection(&mut self, now: Instant) -> Result<LobbyStep> {
        match self.phase {
            LobbyPhase::Idle => {
                self.draft_game = None;
                Ok(Step::none())
            }
            LobbyPhase::Joining => Err(self.joining_error()),
            LobbyPhase::InLobby => {
                let lobby_code = self.require_host()?.lobby_code.clone();
                self.pending.begin(LobbyRequest::SelectGame, now)?;
                Ok(Step::emit(LobbyClientEvent::ClearGame { lobby_code }))
            }
        }
    }

    fn require_idle(&self) -> Result<()> {
        match self.phase {
            LobbyPhase::Idle => Ok(()),
            LobbyPhase::Joining => Err(self.joining_error()),
            LobbyPhase::InLobby => Err(LobbyLinkError::AlreadyInLobby),
        }
    }

    fn joining_error(&self) -> LobbyLinkError {
        let request = self
            .pending
            .kinds()
            .into_iter()
            .find(|k| matches!(k, LobbyRequest::CreateLobby | LobbyRequest::JoinLobby))
            .unwrap_or(LobbyRequest::JoinLobby);
        LobbyLinkError::RequestPending(request.name())
    }

    fn require_lobby(&self) -> Result<&LobbySnapshot> {
        match (self.phase, self.lobby.as_ref()) {
            (LobbyPhase::InLobby, Some(lobby)) => Ok(lobby),
            _ => Err(LobbyLinkError::NotInLobby),
        }
    }

    fn require_host(&self) -> Result<&LobbySnapshot> {
        let lobby = self.require_lobby()?;
        if lobby.host_id != self.local_user_id {
            return Err(LobbyLinkError::NotHost);
        }
        Ok(lobby)
    }

    fn require_other_member(&self, target: &str) -> Result<()> {
        let lobby = self.require_host()?;
        if target == self.local_user_id || lobby.member(target).is_none() {
            return Err(LobbyLinkError::InvalidTarget(target.to_owned()));
        }
        Ok(())
    }

    // ── Server events ───────────────────────────────────────────────

    pub fn apply(
        &mut self,
        event: LobbyServerEvent,
        now: Instant,
        timers: &mut TimerRegistry,
    ) -> LobbyStep {
        match event {
            LobbyServerEvent::LobbyCreated { lobby } => self.install(lobby, "lobby_created", timers),
            LobbyServerEvent::LobbyJoined { lobby } => self.install(lobby, "lobby_joined", timers),
            LobbyServerEvent::LobbyState(lobby) => self.install(lobby, "lobby_state", timers),
            LobbyServerEvent::LobbyLeft { lobby_code } => {
                if self.phase == LobbyPhase::Idle {
                    self.pending.resolve_on("lobby_left");
                    return Step::none();
                }
                let lobby_code =
                    lobby_code.or_else(|| self.lobby.as_ref().map(|l| l.lobby_code.clone()));
                info!(lobby_code = ?lobby_code, "left lobby");
                self.reset(timers);
                Step::notice(LobbyNotice::Left { lobby_code })
            }
            LobbyServerEvent::MemberJoined {
                member,
                current_players,
            } => {
                if let Some(lobby) = self.current_mut() {
                    debug!(user_id = %member.user_id, "member joined");
                    lobby.upsert(member);
                    lobby.current_players = current_players;
                }
                Step::none()
            }
            LobbyServerEvent::MemberLeft {
                user_id,
                current_players,
                ..
            } => {
                if let Some(lobby) = self.current_mut() {
                    lobby.remove(&user_id);
                    lobby.current_players = current_players;
                    self.clear_typing(&user_id, timers);
                }
                Step::none()
            }
            LobbyServerEvent::HostTransferred { new_host_id, .. } => {
                if let Some(lobby) = self.current_mut() {
                    lobby.set_host(new_host_id);
                    self.pending.resolve_on("host_transferred");
                }
                Step::none()
            }
            LobbyServerEvent::SettingsUpdated {
                max_players,
                is_public,
                name,
            } => {
                if let Some(lobby) = self.current_mut() {
                    lobby.max_players = max_players;
                    lobby.is_public = is_public;
                    if name.is_some() {
                        lobby.name = name;
                    }
                    self.pending.resolve_on("settings_updated");
                }
                Step::none()
            }
            LobbyServerEvent::MemberKicked {
                user_id, nickname, ..
            } => {
                if user_id == self.local_user_id {
                    return self.kicked(None, "you were removed from the lobby".to_owned(), timers);
                }
                if let Some(lobby) = self.current_mut() {
                    if lobby.remove(&user_id) {
                        lobby.current_players = lobby.current_players.saturating_sub(1);
                    }
                    debug!(%user_id, %nickname, "member kicked");
                    self.clear_typing(&user_id, timers);
                    self.pending.resolve_on("member_kicked");
                }
                Step::none()
            }
            LobbyServerEvent::MemberReadyChanged {
                user_id, is_ready, ..
            } => {
                if let Some(lobby) = self.current_mut() {
                    if let Some(member) = lobby.members.iter_mut().find(|m| m.user_id == user_id) {
                        member.is_ready = is_ready;
                    }
                    if user_id == self.local_user_id {
                        self.pending.resolve(LobbyRequest::ToggleReady);
                    }
                }
                Step::none()
            }
            LobbyServerEvent::PublicLobbies { lobbies, total } => {
                self.public_lobbies = lobbies;
                self.public_total = total;
                self.pending.resolve_on("public_lobbies");
                Step::none()
            }
            LobbyServerEvent::LobbyMessage(message) => self.on_message(message, timers),
            LobbyServerEvent::LobbyMessagesHistory {
                messages,
                lobby_code,
                ..
            } => {
                if self.current_code() != Some(lobby_code.as_str()) {
                    debug!(%lobby_code, "ignoring history of another lobby");
                    return Step::none();
                }
                for message in messages {
                    if !self.messages.iter().any(|m| m.id == message.id) {
                        self.messages.push(message);
                    }
                }
                self.messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                self.pending.resolve_on("lobby_messages_history");
                Step::none()
            }
            LobbyServerEvent::LobbyUserTyping { user_id, nickname } => {
                if self.phase != LobbyPhase::InLobby || user_id == self.local_user_id {
                    return Step::none();
                }
                timers.schedule_once(
                    TimerKey::new(TimerDomain::LobbyTyping, user_id.clone()),
                    self.typing_expiry,
                    now,
                );
                self.typing.insert(user_id, nickname);
                Step::none()
            }
            LobbyServerEvent::KickedFromLobby {
                lobby_code,
                message,
            } => self.kicked(Some(lobby_code), message, timers),
            LobbyServerEvent::LobbyError {
                message,
                error_code,
            } => self.on_error(message, error_code, timers),
        }
    }

    fn install(
        &mut self,
        info: LobbyInfo,
        event: &'static str,
        timers: &mut TimerRegistry,
    ) -> LobbyStep {
        match self.phase {
            LobbyPhase::Idle => {
                debug!(event, lobby_code = %info.lobby_code, "ignoring snapshot while idle");
                return Step::none();
            }
            LobbyPhase::Joining => {
                if let Some(code) = &self.joining_code {
                    if !code.eq_ignore_ascii_case(&info.lobby_code) {
                        debug!(event, lobby_code = %info.lobby_code, "ignoring snapshot of another lobby");
                        return Step::none();
                    }
                }
            }
            LobbyPhase::InLobby => {
                if self.current_code() != Some(info.lobby_code.as_str()) {
                    debug!(event, lobby_code = %info.lobby_code, "ignoring snapshot of another lobby");
                    return Step::none();
                }
            }
        }

        let entered = self.phase == LobbyPhase::Joining;
        let snapshot = LobbySnapshot::from_info(info);
        let gone: Vec<UserId> = self
            .typing
            .keys()
            .filter(|id| snapshot.member(id).is_none())
            .cloned()
            .collect();
        for user_id in gone {
            self.clear_typing(&user_id, timers);
        }

        let lobby_code = snapshot.lobby_code.clone();
        self.lobby = Some(snapshot);
        self.phase = LobbyPhase::InLobby;
        self.joining_code = None;
        self.pending.resolve_on(event);

        if entered {
            info!(%lobby_code, "entered lobby");
            self.draft_game = None;
            self.last_error = None;
            Step::notice(LobbyNotice::Entered { lobby_code })
        } else {
            Step::none()
        }
    }

    fn on_message(&mut self, message: LobbyMessage, timers: &mut TimerRegistry) -> LobbyStep {
        if self.current_code() != Some(message.lobby_code.as_str()) {
            debug!(lobby_code = %message.lobby_code, "ignoring message of another lobby");
            return Step::none();
        }
        if self.messages.iter().any(|m| m.id == message.id) {
            return Step::none();
        }
        if message.user_id == self.local_user_id {
            self.pending.resolve(LobbyRequest::SendMessage);
        } else {
            self.clear_typing(&message.user_id, timers);
        }
        self.messages.push(message.clone());
        Step::notice(LobbyNotice::Message(message))
    }

    fn on_error(
        &mut self,
        message: String,
        error_code: Option<ErrorCode>,
        timers: &mut TimerRegistry,
    ) -> LobbyStep {
        if error_code.as_ref().is_some_and(ErrorCode::is_kicked) {
            return self.kicked(None, message, timers);
        }
        warn!(?error_code, "lobby error: {message}");
        self.pending.clear();
        if self.phase == LobbyPhase::Joining {
            self.phase = LobbyPhase::Idle;
            self.joining_code = None;
            self.lobby = None;
        }
        let error = LobbyError {
            message,
            error_code,
        };
        self.last_error = Some(error.clone());
        Step::notice(LobbyNotice::Error(error))
    }

    fn kicked(
        &mut self,
        lobby_code: Option<String>,
        message: String,
        timers: &mut TimerRegistry,
    ) -> LobbyStep {
        let lobby_code =
            lobby_code.or_else(|| self.lobby.as_ref().map(|l| l.lobby_code.clone()));
        warn!(lobby_code = ?lobby_code, "kicked from lobby: {message}");
        self.reset(timers);
        self.last_error = Some(LobbyError {
            message: message.clone(),
            error_code: Some(ErrorCode::Kicked),
        });
        Step::notice(LobbyNotice::Kicked {
            lobby_code,
            message,
        })
    }

    // ── Timers and housekeeping ─────────────────────────────────────

    /// Handle a fired timer. Returns `true` if the view changed.
    pub fn on_timer(&mut self, key: &TimerKey) -> bool {
        key.domain == TimerDomain::LobbyTyping && self.typing.remove(&key.id).is_some()
    }

    /// Fail requests that waited longer than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> LobbyStep {
        let mut step = Step::none();
        for request in self.pending.sweep(now, timeout) {
            warn!(request = request.name(), "lobby request timed out");
            if matches!(request, LobbyRequest::CreateLobby | LobbyRequest::JoinLobby)
                && self.phase == LobbyPhase::Joining
            {
                self.phase = LobbyPhase::Idle;
                self.joining_code = None;
            }
            self.last_error = Some(LobbyError {
                message: format!("{} timed out", request.name()),
                error_code: None,
            });
            step = step.with_notice(LobbyNotice::TimedOut {
                request: request.name(),
            });
        }
        step
    }

    /// The lobby channel came back after a drop.
    pub fn on_reconnect(&self) -> LobbyStep {
        if self.phase == LobbyPhase::InLobby {
            Step::emit(LobbyClientEvent::GetLobby {})
        } else {
            Step::none()
        }
    }

    /// Roll back an emit the channel refused: its request is withdrawn and a
    /// create or join that never went out leaves the machine `Idle` again.
    pub fn abort(&mut self, event: &LobbyClientEvent) {
        let Some(request) = LobbyRequest::started_by(event) else {
            return;
        };
        self.pending.abandon(request);
        if matches!(request, LobbyRequest::CreateLobby | LobbyRequest::JoinLobby)
            && self.phase == LobbyPhase::Joining
        {
            debug!(request = request.name(), "request never sent, back to idle");
            self.phase = LobbyPhase::Idle;
            self.joining_code = None;
        }
    }

    /// Drop the lobby and everything tied to it.
    pub fn reset(&mut self, timers: &mut TimerRegistry) {
        self.phase = LobbyPhase::Idle;
        self.joining_code = None;
        self.lobby = None;
        self.pending.clear();
        self.messages.clear();
        self.typing.clear();
        timers.clear_domain(TimerDomain::LobbyTyping);
    }

    fn current_code(&self) -> Option<&str> {
        match self.phase {
            LobbyPhase::InLobby => self.lobby.as_ref().map(|l| l.lobby_code.as_str()),
            _ => None,
        }
    }

    fn current_mut(&mut self) -> Option<&mut LobbySnapshot> {
        match self.phase {
            LobbyPhase::InLobby => self.lobby.as_mut(),
            _ => None,
        }
    }

    fn clear_typing(&mut self, user_id: &str, timers: &mut TimerRegistry) {
        if self.typing.remove(user_id).is_some() {
            timers.cancel(&TimerKey::new(TimerDomain::LobbyTyping, user_id));
        }
    }
}
