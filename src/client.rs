//! Async client driver for the lobby, game and chat channels.
//!
//! [`LobbyLinkClient`] is a thin handle to one background task that owns every
//! state machine, the timer registry and the coordinator. The task is a single
//! cooperative loop: channel events, intents from the handle, timer deadlines
//! and REST completions are processed one at a time, so no two reducers ever
//! run concurrently.
//!
//! State is published through [`tokio::sync::watch`] receivers (one per
//! machine). One-off occurrences are delivered as [`LobbyLinkEvent`]s on the
//! bounded channel returned from [`LobbyLinkClient::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = TransportRegistry::new(
//!     WebSocketConnector::new("wss://play.example.com/ws"),
//!     ReconnectPolicy::default(),
//! );
//! let (client, mut events) = LobbyLinkClient::start(registry, None, LobbyLinkConfig::new("u-1"));
//!
//! client.join_lobby("K3F9QZ").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         LobbyLinkEvent::Navigate(route) => { /* switch screens */ }
//!         LobbyLinkEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::channel::{Channel, ChannelMessage, ChannelStatus, TransportRegistry};
use crate::config::LobbyLinkConfig;
use crate::coordinator::{Coordinator, Directive, Route};
use crate::error::{LobbyLinkError, Result};
use crate::event::LobbyLinkEvent;
use crate::protocol::chat::{ConversationSummary, FriendEvent, HistoryPage, Routed, UploadTarget};
use crate::protocol::{
    ChannelEvent, ChatServerEvent, GameServerEvent, LobbyServerEvent, UserId, CHAT_CHANNEL,
    GAME_CHANNEL, LOBBY_CHANNEL,
};
use crate::state::chat::{check_attachment, ChatStep};
use crate::state::game::GameStep;
use crate::state::lobby::LobbyStep;
use crate::state::{
    ChatEngine, ChatNotice, ChatView, Friend, FriendRoster, GameEngine, GameNotice, GamePhase,
    GameView, LobbyMachine, LobbyNotice, LobbyView, MoveValidator, Now, PageRequest,
    PresenceAggregator, PresenceView, TimerDomain, TimerRegistry,
};

/// Upper bound on coordinator rounds after one input.
const MAX_SETTLE_ROUNDS: usize = 4;

// ── Intents ─────────────────────────────────────────────────────────

enum Intent {
    CreateLobby {
        max_players: u8,
        is_public: bool,
        name: Option<String>,
        game: Option<String>,
    },
    JoinLobby(String),
    LeaveLobby,
    UpdateSettings {
        max_players: u8,
        is_public: bool,
        name: Option<String>,
    },
    TransferHost(UserId),
    KickMember(UserId),
    ToggleReady,
    SendLobbyMessage(String),
    FetchLobbyMessages(Option<u32>),
    FetchPublicLobbies,
    SelectGame(String),
    ClearGameSelection,
    StartGame,
    ProposeMove(Value),
    Forfeit,
    ResyncGame,
    RegisterValidator(String, Arc<dyn MoveValidator>),
    EnsureConversation {
        friend_id: UserId,
        nickname: Option<String>,
        avatar_url: Option<String>,
    },
    OpenConversation(UserId),
    CloseConversation,
    SendChatMessage {
        friend_id: UserId,
        text: Option<String>,
        image_path: Option<String>,
    },
    SendTyping(UserId),
    LoadMore(UserId),
    RefreshConversations,
    SetFriends(Vec<Friend>),
    DismissFriendRequest(String),
}

/// Intent plus the slot its outcome goes back through. A successful chat
/// send answers with the local echo id.
type Command = (Intent, oneshot::Sender<Result<Option<String>>>);

enum RestDone {
    Page(PageRequest, Result<HistoryPage>),
    Summaries(Result<Vec<ConversationSummary>>),
}

struct Publishers {
    lobby: watch::Sender<LobbyView>,
    game: watch::Sender<GameView>,
    chat: watch::Sender<ChatView>,
    presence: watch::Sender<PresenceView>,
    route: watch::Sender<Route>,
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to the client loop.
///
/// Created via [`LobbyLinkClient::start`]. Intent methods are `async`: they
/// return once the loop has validated the intent and queued its emit, not when
/// the server replies. Server confirmation shows up in the published views.
pub struct LobbyLinkClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    lobby_rx: watch::Receiver<LobbyView>,
    game_rx: watch::Receiver<GameView>,
    chat_rx: watch::Receiver<ChatView>,
    presence_rx: watch::Receiver<PresenceView>,
    route_rx: watch::Receiver<Route>,
    registry: TransportRegistry,
    api: Option<Arc<dyn ChatApi>>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl LobbyLinkClient {
    /// Spawn the client loop and return a handle plus event receiver.
    ///
    /// The loop connects the `lobby`, `game` and `chat` channels of
    /// `registry`. `api` backs chat history and attachments; without it those
    /// operations fail with [`LobbyLinkError::Http`].
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        registry: TransportRegistry,
        api: Option<Arc<dyn ChatApi>>,
        config: LobbyLinkConfig,
    ) -> (Self, mpsc::Receiver<LobbyLinkEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<LobbyLinkEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let (lobby_tx, lobby_rx) = watch::channel(LobbyView::default());
        let (game_tx, game_rx) = watch::channel(GameView::default());
        let (chat_tx, chat_rx) = watch::channel(ChatView::default());
        let (presence_tx, presence_rx) = watch::channel(PresenceView::default());
        let (route_tx, route_rx) = watch::channel(Route::Home);

        let driver = Driver::new(
            &registry,
            api.clone(),
            config.clone(),
            event_tx,
            Publishers {
                lobby: lobby_tx,
                game: game_tx,
                chat: chat_tx,
                presence: presence_tx,
                route: route_tx,
            },
        );
        let task = tokio::spawn(client_loop(driver, registry.clone(), cmd_rx, shutdown_rx));

        let client = Self {
            cmd_tx,
            lobby_rx,
            game_rx,
            chat_rx,
            presence_rx,
            route_rx,
            registry,
            api,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        (client, event_rx)
    }

    // ── Lobby ───────────────────────────────────────────────────────

    /// Create a lobby. `game` falls back to the game picked with
    /// [`select_game`](Self::select_game) while idle.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::AlreadyInLobby`], [`LobbyLinkError::RequestPending`],
    /// or [`LobbyLinkError::ClientClosed`].
    pub async fn create_lobby(
        &self,
        max_players: u8,
        is_public: bool,
        name: Option<String>,
        game: Option<String>,
    ) -> Result<()> {
        self.perform(Intent::CreateLobby {
            max_players,
            is_public,
            name,
            game,
        })
        .await
    }

    /// Join the lobby with `lobby_code`.
    ///
    /// # Errors
    ///
    /// Same as [`create_lobby`](Self::create_lobby).
    pub async fn join_lobby(&self, lobby_code: impl Into<String>) -> Result<()> {
        self.perform(Intent::JoinLobby(lobby_code.into())).await
    }

    /// # Errors
    ///
    /// [`LobbyLinkError::NotInLobby`] outside a lobby.
    pub async fn leave_lobby(&self) -> Result<()> {
        self.perform(Intent::LeaveLobby).await
    }

    /// Host only.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::NotHost`] for other members.
    pub async fn update_settings(
        &self,
        max_players: u8,
        is_public: bool,
        name: Option<String>,
    ) -> Result<()> {
        self.perform(Intent::UpdateSettings {
            max_players,
            is_public,
            name,
        })
        .await
    }

    /// Host only.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::InvalidTarget`] for the local user or a non-member.
    pub async fn transfer_host(&self, user_id: impl Into<UserId>) -> Result<()> {
        self.perform(Intent::TransferHost(user_id.into())).await
    }

    /// Host only.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::InvalidTarget`] for the local user or a non-member.
    pub async fn kick_member(&self, user_id: impl Into<UserId>) -> Result<()> {
        self.perform(Intent::KickMember(user_id.into())).await
    }

    /// # Errors
    ///
    /// [`LobbyLinkError::NotInLobby`] outside a lobby.
    pub async fn toggle_ready(&self) -> Result<()> {
        self.perform(Intent::ToggleReady).await
    }

    /// # Errors
    ///
    /// [`LobbyLinkError::EmptyMessage`] for blank text.
    pub async fn send_lobby_message(&self, text: impl Into<String>) -> Result<()> {
        self.perform(Intent::SendLobbyMessage(text.into())).await
    }

    /// Fetch lobby chat history; `None` uses the configured limit.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::NotInLobby`] outside a lobby.
    pub async fn fetch_lobby_messages(&self, limit: Option<u32>) -> Result<()> {
        self.perform(Intent::FetchLobbyMessages(limit)).await
    }

    /// # Errors
    ///
    /// [`LobbyLinkError::RequestPending`] while a fetch is in flight.
    pub async fn fetch_public_lobbies(&self) -> Result<()> {
        self.perform(Intent::FetchPublicLobbies).await
    }

    /// Pick a game. Local draft while idle, `select_game` for the host.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::NotHost`] for members other than the host.
    pub async fn select_game(&self, game_name: impl Into<String>) -> Result<()> {
        self.perform(Intent::SelectGame(game_name.into())).await
    }

    /// # Errors
    ///
    /// [`LobbyLinkError::NotHost`] for members other than the host.
    pub async fn clear_game_selection(&self) -> Result<()> {
        self.perform(Intent::ClearGameSelection).await
    }

    // ── Game ────────────────────────────────────────────────────────

    /// Host only: start the selected game once the lobby can start.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::NotReadyToStart`] naming the unmet condition.
    pub async fn start_game(&self) -> Result<()> {
        self.perform(Intent::StartGame).await
    }

    /// Propose a move; the board only changes when the server answers.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::NotYourTurn`], [`LobbyLinkError::MoveInFlight`] or
    /// [`LobbyLinkError::IllegalMove`].
    pub async fn propose_move(&self, move_data: Value) -> Result<()> {
        self.perform(Intent::ProposeMove(move_data)).await
    }

    /// # Errors
    ///
    /// [`LobbyLinkError::NotInGame`] with no game running.
    pub async fn forfeit(&self) -> Result<()> {
        self.perform(Intent::Forfeit).await
    }

    /// Re-request the full game state.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::ClientClosed`] after shutdown.
    pub async fn resync_game(&self) -> Result<()> {
        self.perform(Intent::ResyncGame).await
    }

    /// Install a client-side move pre-check for `game_name`.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::ClientClosed`] after shutdown.
    pub async fn register_validator(
        &self,
        game_name: impl Into<String>,
        validator: Arc<dyn MoveValidator>,
    ) -> Result<()> {
        self.perform(Intent::RegisterValidator(game_name.into(), validator))
            .await
    }

    // ── Chat ────────────────────────────────────────────────────────

    /// Create the conversation with `friend_id` unless it exists.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::ClientClosed`] after shutdown.
    pub async fn ensure_conversation(
        &self,
        friend_id: impl Into<UserId>,
        nickname: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<()> {
        self.perform(Intent::EnsureConversation {
            friend_id: friend_id.into(),
            nickname,
            avatar_url,
        })
        .await
    }

    /// Make `friend_id` the active conversation and reset its unread count.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::ClientClosed`] after shutdown.
    pub async fn open_conversation(&self, friend_id: impl Into<UserId>) -> Result<()> {
        self.perform(Intent::OpenConversation(friend_id.into())).await
    }

    /// # Errors
    ///
    /// [`LobbyLinkError::ClientClosed`] after shutdown.
    pub async fn close_conversation(&self) -> Result<()> {
        self.perform(Intent::CloseConversation).await
    }

    /// Send a text message. Returns the id of the local echo.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::EmptyMessage`] or
    /// [`LobbyLinkError::UnknownConversation`].
    pub async fn send_message(
        &self,
        friend_id: impl Into<UserId>,
        text: impl Into<String>,
    ) -> Result<String> {
        self.send_chat(friend_id.into(), Some(text.into()), None).await
    }

    /// Ask for a signed upload target. The caller uploads the bytes and then
    /// calls [`send_attachment`](Self::send_attachment).
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::InvalidAttachment`] for non-image uploads, or any
    /// REST error.
    pub async fn request_upload_target(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<UploadTarget> {
        check_attachment(filename, content_type)?;
        let api = self.api.as_ref().ok_or_else(no_api)?;
        api.request_upload_target(filename, content_type).await
    }

    /// Send a message referencing an uploaded image. Returns the id of the
    /// local echo.
    ///
    /// # Errors
    ///
    /// Same as [`send_message`](Self::send_message).
    pub async fn send_attachment(
        &self,
        friend_id: impl Into<UserId>,
        target: &UploadTarget,
        caption: Option<String>,
    ) -> Result<String> {
        self.send_chat(friend_id.into(), caption, Some(target.image_path.clone()))
            .await
    }

    /// Emit `typing`, throttled per conversation.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::UnknownConversation`].
    pub async fn send_typing(&self, friend_id: impl Into<UserId>) -> Result<()> {
        self.perform(Intent::SendTyping(friend_id.into())).await
    }

    /// Fetch the next older page of history.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::UnknownConversation`], or
    /// [`LobbyLinkError::Http`] without a REST api.
    pub async fn load_more(&self, friend_id: impl Into<UserId>) -> Result<()> {
        self.perform(Intent::LoadMore(friend_id.into())).await
    }

    /// Reload the conversation list from the REST api.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::Http`] without a REST api.
    pub async fn refresh_conversations(&self) -> Result<()> {
        self.perform(Intent::RefreshConversations).await
    }

    // ── Friends ─────────────────────────────────────────────────────

    /// Replace the friend list, e.g. after loading the profile.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::ClientClosed`] after shutdown.
    pub async fn set_friends(&self, friends: Vec<Friend>) -> Result<()> {
        self.perform(Intent::SetFriends(friends)).await
    }

    /// Drop a friend request that was answered elsewhere.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::ClientClosed`] after shutdown.
    pub async fn dismiss_friend_request(&self, request_id: impl Into<String>) -> Result<()> {
        self.perform(Intent::DismissFriendRequest(request_id.into()))
            .await
    }

    // ── Views ───────────────────────────────────────────────────────

    pub fn lobby(&self) -> LobbyView {
        self.lobby_rx.borrow().clone()
    }

    pub fn game(&self) -> GameView {
        self.game_rx.borrow().clone()
    }

    pub fn chat(&self) -> ChatView {
        self.chat_rx.borrow().clone()
    }

    pub fn presence(&self) -> PresenceView {
        self.presence_rx.borrow().clone()
    }

    pub fn route(&self) -> Route {
        self.route_rx.borrow().clone()
    }

    /// Receiver that is notified whenever the lobby view changes.
    pub fn watch_lobby(&self) -> watch::Receiver<LobbyView> {
        self.lobby_rx.clone()
    }

    pub fn watch_game(&self) -> watch::Receiver<GameView> {
        self.game_rx.clone()
    }

    pub fn watch_chat(&self) -> watch::Receiver<ChatView> {
        self.chat_rx.clone()
    }

    pub fn watch_presence(&self) -> watch::Receiver<PresenceView> {
        self.presence_rx.clone()
    }

    pub fn watch_route(&self) -> watch::Receiver<Route> {
        self.route_rx.clone()
    }

    /// Status of the shared connection.
    pub fn connection_status(&self) -> ChannelStatus {
        self.registry.connection_status()
    }

    /// Stop the loop, clear every timer and release the connection.
    ///
    /// After this the event receiver yields
    /// [`Disconnected`](LobbyLinkEvent::Disconnected) and then `None`.
    pub async fn shutdown(&mut self) {
        debug!("LobbyLinkClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("client loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("client loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("client loop aborted: {join_err}");
                    }
                    self.registry.shutdown().await;
                }
            }
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn request(&self, intent: Intent) -> Result<Option<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send((intent, reply_tx))
            .map_err(|_| LobbyLinkError::ClientClosed)?;
        reply_rx.await.map_err(|_| LobbyLinkError::ClientClosed)?
    }

    async fn perform(&self, intent: Intent) -> Result<()> {
        self.request(intent).await.map(|_| ())
    }

    async fn send_chat(
        &self,
        friend_id: UserId,
        text: Option<String>,
        image_path: Option<String>,
    ) -> Result<String> {
        let local_id = self
            .request(Intent::SendChatMessage {
                friend_id,
                text,
                image_path,
            })
            .await?;
        local_id.ok_or(LobbyLinkError::ClientClosed)
    }
}

impl std::fmt::Debug for LobbyLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbyLinkClient")
            .field("connection", &self.connection_status())
            .field("route", &*self.route_rx.borrow())
            .field("has_api", &self.api.is_some())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for LobbyLinkClient {
    fn drop(&mut self) {
        // Only aborting is possible here; releasing the connection needs a
        // runtime, so it is handed to one if we are inside it.
        if let Some(task) = self.task.take() {
            task.abort();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let registry = self.registry.clone();
                handle.spawn(async move { registry.shutdown().await });
            }
        }
    }
}

fn no_api() -> LobbyLinkError {
    LobbyLinkError::Http("no REST api configured".to_owned())
}

// ── Client loop ─────────────────────────────────────────────────────

/// Everything the loop owns.
struct Driver {
    config: LobbyLinkConfig,
    api: Option<Arc<dyn ChatApi>>,
    lobby_channel: Channel,
    game_channel: Channel,
    chat_channel: Channel,
    statuses: HashMap<&'static str, ChannelStatus>,
    timers: TimerRegistry,
    lobby: LobbyMachine,
    game: GameEngine,
    chat: ChatEngine,
    presence: PresenceAggregator,
    roster: FriendRoster,
    coordinator: Coordinator,
    rest: JoinSet<RestDone>,
    event_tx: mpsc::Sender<LobbyLinkEvent>,
    publishers: Publishers,
}

/// Background loop multiplexing every input via `tokio::select!`.
///
/// Exits when the shutdown signal fires or the handle is dropped.
async fn client_loop(
    mut driver: Driver,
    registry: TransportRegistry,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("client loop started");

    // Subscribe before connecting so no status change is missed.
    let mut lobby_rx = driver.lobby_channel.subscribe();
    let mut game_rx = driver.game_channel.subscribe();
    let mut chat_rx = driver.chat_channel.subscribe();
    for name in [LOBBY_CHANNEL, GAME_CHANNEL, CHAT_CHANNEL] {
        registry.connect(name).await;
    }

    let mut tick = tokio::time::interval(driver.config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let deadline = driver.timers.next_deadline();
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break "client shut down";
            }
            cmd = cmd_rx.recv() => match cmd {
                Some((intent, reply)) => {
                    let outcome = driver.handle(intent);
                    if let Err(e) = &outcome {
                        debug!("intent rejected: {e}");
                    }
                    // Views are published before the caller resumes.
                    driver.settle();
                    let _ = reply.send(outcome);
                }
                None => {
                    debug!("command channel closed, shutting down client loop");
                    break "client shut down";
                }
            },
            Some(message) = lobby_rx.recv() => driver.on_channel(LOBBY_CHANNEL, message),
            Some(message) = game_rx.recv() => driver.on_channel(GAME_CHANNEL, message),
            Some(message) = chat_rx.recv() => driver.on_channel(CHAT_CHANNEL, message),
            Some(joined) = driver.rest.join_next(), if !driver.rest.is_empty() => match joined {
                Ok(done) => driver.on_rest(done),
                Err(e) => warn!("REST task failed: {e}"),
            },
            _ = tick.tick() => driver.housekeeping(),
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                driver.fire_timers(Now::current());
            }
        }
        driver.settle();
    };

    driver.teardown();
    registry.shutdown().await;
    emit_disconnected(&driver.event_tx, Some(reason.to_owned())).await;
    debug!("client loop exited");
}

impl Driver {
    fn new(
        registry: &TransportRegistry,
        api: Option<Arc<dyn ChatApi>>,
        config: LobbyLinkConfig,
        event_tx: mpsc::Sender<LobbyLinkEvent>,
        publishers: Publishers,
    ) -> Self {
        let user = config.local_user_id.clone();
        Self {
            lobby: LobbyMachine::new(user.clone(), config.typing_expiry),
            game: GameEngine::new(user.clone(), config.resync_poll_interval),
            chat: ChatEngine::new(
                user,
                config.typing_expiry,
                config.typing_throttle,
                config.chat_page_size,
            ),
            lobby_channel: registry.channel(LOBBY_CHANNEL),
            game_channel: registry.channel(GAME_CHANNEL),
            chat_channel: registry.channel(CHAT_CHANNEL),
            statuses: HashMap::new(),
            timers: TimerRegistry::new(),
            presence: PresenceAggregator::new(),
            roster: FriendRoster::new(),
            coordinator: Coordinator::new(),
            rest: JoinSet::new(),
            config,
            api,
            event_tx,
            publishers,
        }
    }

    // ── Intents ─────────────────────────────────────────────────────

    fn handle(&mut self, intent: Intent) -> Result<Option<String>> {
        let now = Now::current();
        match intent {
            Intent::CreateLobby {
                max_players,
                is_public,
                name,
                game,
            } => {
                let step = self
                    .lobby
                    .create_lobby(max_players, is_public, name, game, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::JoinLobby(code) => {
                let step = self.lobby.join_lobby(&code, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::LeaveLobby => {
                let step = self.lobby.leave_lobby(now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::UpdateSettings {
                max_players,
                is_public,
                name,
            } => {
                let step = self
                    .lobby
                    .update_settings(max_players, is_public, name, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::TransferHost(target) => {
                let step = self.lobby.transfer_host(&target, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::KickMember(target) => {
                let step = self.lobby.kick_member(&target, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::ToggleReady => {
                let step = self.lobby.toggle_ready(now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::SendLobbyMessage(text) => {
                let step = self.lobby.send_message(&text, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::FetchLobbyMessages(limit) => {
                let limit = limit.unwrap_or(self.config.lobby_message_limit);
                let step = self.lobby.fetch_messages(limit, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::FetchPublicLobbies => {
                let step = self.lobby.fetch_public_lobbies(now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::SelectGame(game_name) => {
                let step = self.lobby.select_game(&game_name, now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::ClearGameSelection => {
                let step = self.lobby.clear_game_selection(now.instant)?;
                self.dispatch_lobby(step)?;
            }
            Intent::StartGame => {
                self.lobby.check_start()?;
                let step = self.game.start_game(now)?;
                self.dispatch_game(step)?;
            }
            Intent::ProposeMove(move_data) => {
                let step = self.game.propose_move(move_data, now)?;
                self.dispatch_game(step)?;
            }
            Intent::Forfeit => {
                let step = self.game.forfeit(now)?;
                self.dispatch_game(step)?;
            }
            Intent::ResyncGame => {
                let step = self.game.resync();
                self.dispatch_game(step)?;
            }
            Intent::RegisterValidator(game_name, validator) => {
                self.game.register_validator(game_name, validator);
            }
            Intent::EnsureConversation {
                friend_id,
                nickname,
                avatar_url,
            } => {
                self.chat.ensure_conversation(&friend_id, nickname, avatar_url);
            }
            Intent::OpenConversation(friend_id) => self.chat.open_conversation(&friend_id),
            Intent::CloseConversation => self.chat.close_conversation(),
            Intent::SendChatMessage {
                friend_id,
                text,
                image_path,
            } => {
                let (local_id, step) =
                    self.chat
                        .send_message(&friend_id, text.as_deref(), image_path, now)?;
                if let Err(e) = self.dispatch_chat(step) {
                    self.chat.mark_failed(&friend_id, &local_id);
                    return Err(e);
                }
                return Ok(Some(local_id));
            }
            Intent::SendTyping(friend_id) => {
                let step = self.chat.send_typing(&friend_id, now.instant)?;
                self.dispatch_chat(step)?;
            }
            Intent::LoadMore(friend_id) => {
                let api = self.api.clone().ok_or_else(no_api)?;
                if let Some(request) = self.chat.load_more(&friend_id)? {
                    debug!(friend_id = %request.friend_id, before = ?request.before, "fetching history page");
                    self.rest.spawn(async move {
                        let result = api
                            .fetch_history(&request.friend_id, request.before.as_deref(), request.limit)
                            .await;
                        RestDone::Page(request, result)
                    });
                }
            }
            Intent::RefreshConversations => {
                let api = self.api.clone().ok_or_else(no_api)?;
                self.refresh_conversations(api);
            }
            Intent::SetFriends(friends) => self.roster.set_friends(friends),
            Intent::DismissFriendRequest(request_id) => {
                self.roster.remove_request(&request_id);
            }
        }
        Ok(None)
    }

    fn refresh_conversations(&mut self, api: Arc<dyn ChatApi>) {
        self.rest.spawn(async move { RestDone::Summaries(api.fetch_conversations().await) });
    }

    // ── Channel input ───────────────────────────────────────────────

    fn on_channel(&mut self, channel: &'static str, message: ChannelMessage) {
        match message {
            ChannelMessage::Status(status) => self.on_status(channel, status),
            ChannelMessage::Event { event, data } => {
                let now = Now::current();
                if channel == LOBBY_CHANNEL {
                    self.on_lobby_event(&event, &data, now);
                } else if channel == GAME_CHANNEL {
                    self.on_game_event(&event, &data, now);
                } else {
                    self.on_chat_event(&event, &data, now);
                }
            }
        }
    }

    fn on_status(&mut self, channel: &'static str, status: ChannelStatus) {
        let previous = self
            .statuses
            .insert(channel, status)
            .unwrap_or_default();
        emit_event(
            &self.event_tx,
            LobbyLinkEvent::Connection {
                channel: channel.to_owned(),
                status,
            },
        );
        if !status.is_connected() || previous.is_connected() {
            return;
        }
        info!(channel, "channel (re)connected");
        if channel == LOBBY_CHANNEL {
            let step = self.lobby.on_reconnect();
            let _ = self.dispatch_lobby(step);
        } else if channel == GAME_CHANNEL {
            if self.game.phase() != GamePhase::Idle {
                let step = self.game.resync();
                let _ = self.dispatch_game(step);
            }
        } else {
            self.presence.new_epoch();
            if let Some(api) = self.api.clone() {
                self.refresh_conversations(api);
            }
        }
    }

    fn on_lobby_event(&mut self, name: &str, data: &Value, now: Now) {
        let event = match LobbyServerEvent::decode(name, data) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = LOBBY_CHANNEL, event = %name, "dropping undecodable event: {e}");
                return;
            }
        };
        let step = self.lobby.apply(event, now.instant, &mut self.timers);
        let _ = self.dispatch_lobby(step);
    }

    fn on_game_event(&mut self, name: &str, data: &Value, now: Now) {
        let event = match GameServerEvent::decode(name, data) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = GAME_CHANNEL, event = %name, "dropping undecodable event: {e}");
                return;
            }
        };
        let step = self.game.apply(event, now, &mut self.timers);
        let _ = self.dispatch_game(step);
    }

    fn on_chat_event(&mut self, name: &str, data: &Value, now: Now) {
        let event = match ChatServerEvent::decode(name, data) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = CHAT_CHANNEL, event = %name, "dropping undecodable event: {e}");
                return;
            }
        };
        match event.route() {
            Routed::Conversation(event) => {
                let step = self.chat.apply(event, now.instant, &mut self.timers);
                let _ = self.dispatch_chat(step);
            }
            Routed::Presence(event) => {
                self.presence.apply(event);
            }
            Routed::Friends(event) => {
                let notice = match &event {
                    FriendEvent::RequestReceived(request) => {
                        LobbyLinkEvent::FriendRequest(request.clone())
                    }
                    FriendEvent::Removed { user_id } => LobbyLinkEvent::FriendRemoved {
                        user_id: user_id.clone(),
                    },
                };
                if self.roster.apply(event) {
                    emit_event(&self.event_tx, notice);
                }
            }
        }
    }

    fn on_rest(&mut self, done: RestDone) {
        match done {
            RestDone::Page(request, result) => {
                let step = self.chat.apply_page(&request, result);
                let _ = self.dispatch_chat(step);
            }
            RestDone::Summaries(Ok(summaries)) => {
                debug!(count = summaries.len(), "conversation summaries loaded");
                self.chat.apply_summaries(summaries);
            }
            RestDone::Summaries(Err(e)) => warn!("failed to load conversations: {e}"),
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn housekeeping(&mut self) {
        let now = Now::current();
        let step = self.lobby.sweep(now.instant, self.config.request_timeout);
        let _ = self.dispatch_lobby(step);
        let step = self.game.sweep(now, self.config.request_timeout);
        let _ = self.dispatch_game(step);
        self.fire_timers(now);
    }

    fn fire_timers(&mut self, now: Now) {
        for key in self.timers.fire_due(now.instant) {
            match key.domain {
                TimerDomain::LobbyTyping => {
                    self.lobby.on_timer(&key);
                }
                TimerDomain::ChatTyping => {
                    self.chat.on_timer(&key);
                }
                TimerDomain::TurnClock | TimerDomain::GameResync => {
                    let step = self.game.on_timer(&key, now, &mut self.timers);
                    let _ = self.dispatch_game(step);
                }
            }
        }
    }

    // ── Steps ───────────────────────────────────────────────────────

    fn dispatch_lobby(&mut self, step: LobbyStep) -> Result<()> {
        let (refused, sent) = send_all(&self.lobby_channel, &step.emits);
        for event in refused {
            self.lobby.abort(event);
        }
        for notice in step.notices {
            let event = match notice {
                LobbyNotice::Entered { lobby_code } => LobbyLinkEvent::LobbyEntered { lobby_code },
                LobbyNotice::Left { lobby_code } => LobbyLinkEvent::LobbyLeft { lobby_code },
                LobbyNotice::Kicked {
                    lobby_code,
                    message,
                } => LobbyLinkEvent::Kicked {
                    lobby_code,
                    message,
                },
                LobbyNotice::Error(error) => LobbyLinkEvent::LobbyError(error),
                LobbyNotice::TimedOut { request } => LobbyLinkEvent::RequestTimedOut {
                    channel: LOBBY_CHANNEL,
                    request,
                },
                LobbyNotice::Message(message) => LobbyLinkEvent::LobbyMessage(message),
            };
            emit_event(&self.event_tx, event);
        }
        sent
    }

    fn dispatch_game(&mut self, step: GameStep) -> Result<()> {
        let (refused, sent) = send_all(&self.game_channel, &step.emits);
        for event in refused {
            self.game.abort(event);
        }
        for notice in step.notices {
            let event = match notice {
                GameNotice::Started {
                    lobby_code,
                    game_name,
                } => LobbyLinkEvent::GameStarted {
                    lobby_code,
                    game_name,
                },
                GameNotice::MoveApplied { player_id } => LobbyLinkEvent::MoveApplied { player_id },
                GameNotice::Ended { result, winner_id } => {
                    LobbyLinkEvent::GameEnded { result, winner_id }
                }
                GameNotice::Forfeited {
                    player_id,
                    winner_id,
                } => LobbyLinkEvent::PlayerForfeited {
                    player_id,
                    winner_id,
                },
                GameNotice::Error { message } => LobbyLinkEvent::GameError { message },
                GameNotice::TimedOut { request } => LobbyLinkEvent::RequestTimedOut {
                    channel: GAME_CHANNEL,
                    request,
                },
            };
            emit_event(&self.event_tx, event);
        }
        sent
    }

    fn dispatch_chat(&mut self, step: ChatStep) -> Result<()> {
        let (_, sent) = send_all(&self.chat_channel, &step.emits);
        for notice in step.notices {
            let event = match notice {
                ChatNotice::Incoming { friend_id, message } => {
                    LobbyLinkEvent::ChatMessage { friend_id, message }
                }
                ChatNotice::HistoryFailed { friend_id, message } => {
                    LobbyLinkEvent::ChatHistoryFailed { friend_id, message }
                }
            };
            emit_event(&self.event_tx, event);
        }
        sent
    }

    // ── Coordination and publishing ─────────────────────────────────

    /// Let the coordinator react to the new views, then publish them.
    fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut directives = self.coordinator.observe_lobby(&self.lobby.view());
            directives.extend(self.coordinator.observe_game(&self.game.view()));
            if directives.is_empty() {
                break;
            }
            for directive in directives {
                self.apply_directive(directive);
            }
        }
        self.publish();
    }

    fn apply_directive(&mut self, directive: Directive) {
        debug!(?directive, "coordinator directive");
        match directive {
            Directive::Navigate(route) => {
                publish(&self.publishers.route, route.clone());
                emit_event(&self.event_tx, LobbyLinkEvent::Navigate(route));
            }
            Directive::SetGameContext(context) => self.game.set_context(context),
            Directive::EnterGame => {
                let step = self.game.enter();
                let _ = self.dispatch_game(step);
            }
            Directive::ResetGame => self.game.reset(&mut self.timers),
        }
    }

    fn publish(&self) {
        publish(&self.publishers.lobby, self.lobby.view());
        publish(&self.publishers.game, self.game.view());
        publish(&self.publishers.chat, self.chat.view());
        publish(
            &self.publishers.presence,
            PresenceView::build(&self.presence, &self.roster),
        );
    }

    fn teardown(&mut self) {
        self.rest.abort_all();
        self.lobby.reset(&mut self.timers);
        self.game.reset(&mut self.timers);
        self.chat.reset(&mut self.timers);
        self.timers.clear_all();
        self.publish();
    }
}

/// Emit in order. Returns the events the channel refused and the first error.
fn send_all<'a, E: ChannelEvent>(channel: &Channel, emits: &'a [E]) -> (Vec<&'a E>, Result<()>) {
    let mut refused = Vec::new();
    let mut first_error = None;
    for event in emits {
        if let Err(e) = channel.emit_event(event) {
            warn!(channel = channel.name(), "emit failed: {e}");
            refused.push(event);
            first_error.get_or_insert(e);
        }
    }
    (refused, first_error.map_or(Ok(()), Err))
}

/// Replace the watched value, notifying receivers only on change.
fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the loop.
fn emit_event(event_tx: &mpsc::Sender<LobbyLinkEvent>, event: LobbyLinkEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Emit the final [`Disconnected`](LobbyLinkEvent::Disconnected) event.
///
/// Uses `send().await` instead of `try_send` because it is always the last
/// event on the channel and must never be dropped.
async fn emit_disconnected(event_tx: &mpsc::Sender<LobbyLinkEvent>, reason: Option<String>) {
    let event = LobbyLinkEvent::Disconnected { reason };
    if event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::channel::ReconnectPolicy;
    use crate::transport::{Connector, Transport};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    // ── Mock connector ──────────────────────────────────────────────

    /// Transport that records sent frames and never receives anything.
    struct SilentTransport {
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for SilentTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), LobbyLinkError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, LobbyLinkError>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> std::result::Result<(), LobbyLinkError> {
            Ok(())
        }
    }

    struct SilentConnector {
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connector for SilentConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, LobbyLinkError> {
            Ok(Box::new(SilentTransport {
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    fn start_client(
        config: LobbyLinkConfig,
    ) -> (
        LobbyLinkClient,
        mpsc::Receiver<LobbyLinkEvent>,
        Arc<StdMutex<Vec<String>>>,
    ) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let registry = TransportRegistry::new(
            SilentConnector {
                sent: Arc::clone(&sent),
            },
            ReconnectPolicy::default(),
        );
        let (client, events) = LobbyLinkClient::start(registry, None, config);
        (client, events, sent)
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn join_lobby_emits_frame_and_marks_joining() {
        let (mut client, _events, sent) = start_client(LobbyLinkConfig::new("u-1"));
        client.join_lobby("K3F9QZ").await.unwrap();

        let mut lobby = client.watch_lobby();
        lobby
            .wait_for(|view| view.phase == crate::state::LobbyPhase::Joining)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if sent.lock().unwrap().iter().any(|f| f.contains("join_lobby")) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn domain_rejections_come_back_to_the_caller() {
        let (mut client, _events, _sent) = start_client(LobbyLinkConfig::new("u-1"));
        assert!(matches!(
            client.leave_lobby().await,
            Err(LobbyLinkError::NotInLobby)
        ));
        assert!(matches!(
            client.start_game().await,
            Err(LobbyLinkError::NotInLobby)
        ));
        assert!(matches!(
            client.send_message("u-2", "hi").await,
            Err(LobbyLinkError::UnknownConversation(id)) if id == "u-2"
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn chat_rest_calls_fail_without_api() {
        let (mut client, _events, _sent) = start_client(LobbyLinkConfig::new("u-1"));
        assert!(matches!(
            client.refresh_conversations().await,
            Err(LobbyLinkError::Http(_))
        ));
        assert!(matches!(
            client.request_upload_target("photo.png", "image/png").await,
            Err(LobbyLinkError::Http(_))
        ));
        assert!(matches!(
            client.request_upload_target("notes.txt", "text/plain").await,
            Err(LobbyLinkError::InvalidAttachment(_))
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_emits_disconnected_and_closes_handle() {
        let (mut client, mut events, _sent) = start_client(LobbyLinkConfig::new("u-1"));
        client.shutdown().await;

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(LobbyLinkEvent::Disconnected {
                reason: Some("client shut down".into())
            })
        );
        assert!(matches!(
            client.toggle_ready().await,
            Err(LobbyLinkError::ClientClosed)
        ));
        assert_eq!(client.connection_status(), ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn double_shutdown_does_not_panic() {
        let (mut client, _events, _sent) = start_client(LobbyLinkConfig::new("u-1"));
        client.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn zero_event_channel_capacity_does_not_panic() {
        let config = LobbyLinkConfig::new("u-1").with_event_channel_capacity(0);
        let (mut client, _events, _sent) = start_client(config);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown() {
        let (client, _events, _sent) = start_client(LobbyLinkConfig::new("u-1"));
        drop(client);
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let (mut client, _events, _sent) = start_client(LobbyLinkConfig::new("u-1"));
        let debug = format!("{client:?}");
        assert!(debug.contains("LobbyLinkClient"));
        assert!(debug.contains("has_api: false"));
        client.shutdown().await;
    }
}
