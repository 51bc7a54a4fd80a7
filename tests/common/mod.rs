#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for LobbyLink client integration tests.
//!
//! Provides a channel-backed [`MockConnector`] whose connections are driven
//! from the test through a [`ServerSide`], a scripted [`MockChatApi`], and
//! builders for the JSON payloads the server pushes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lobbylink_client::api::ChatApi;
use lobbylink_client::error::Result;
use lobbylink_client::protocol::chat::{ConversationSummary, HistoryPage, UploadTarget};
use lobbylink_client::{
    Connector, Frame, LobbyLinkClient, LobbyLinkConfig, LobbyLinkError, LobbyLinkEvent,
    ReconnectPolicy, Transport, TransportRegistry,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(2);

// ── MockTransport ───────────────────────────────────────────────────

/// One connection. Frames pushed by the test arrive through `incoming`; every
/// frame the client sends is forwarded to `outgoing`.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> std::result::Result<(), LobbyLinkError> {
        self.outgoing
            .send(message)
            .map_err(|_| LobbyLinkError::TransportSend("test server gone".into()))
    }

    async fn recv(&mut self) -> Option<std::result::Result<String, LobbyLinkError>> {
        // `None` once the test drops its sender: the server closed the link.
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> std::result::Result<(), LobbyLinkError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// The test's end of one connection.
pub struct ServerSide {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    pub closed: Arc<AtomicBool>,
}

impl ServerSide {
    /// Push `event` with `data` on `channel`.
    pub fn push(&self, channel: &str, event: &str, data: Value) {
        let text = Frame::new(channel, event, data).to_text().unwrap();
        self.to_client
            .as_ref()
            .expect("connection already dropped")
            .send(text)
            .expect("client side gone");
    }

    /// Push a raw text frame, e.g. garbage.
    pub fn push_raw(&self, text: &str) {
        self.to_client
            .as_ref()
            .expect("connection already dropped")
            .send(text.to_owned())
            .expect("client side gone");
    }

    /// Wait for the next frame on `channel` named `event`, skipping others.
    pub async fn expect(&mut self, channel: &str, event: &str) -> Value {
        let wait = async {
            loop {
                let text = self
                    .from_client
                    .recv()
                    .await
                    .unwrap_or_else(|| panic!("connection closed while waiting for {channel}/{event}"));
                let frame = Frame::parse(&text).unwrap();
                if frame.channel == channel && frame.event == event {
                    return frame.data;
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {channel}/{event}"))
    }

    /// Every frame the client has sent so far that was not consumed yet.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(Frame::parse(&text).unwrap());
        }
        frames
    }

    /// Drop the server's sender so the client sees the link close.
    pub fn drop_link(&mut self) {
        self.to_client = None;
    }
}

/// Create a connected transport pair.
pub fn mock_link() -> (MockTransport, ServerSide) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MockTransport {
            incoming,
            outgoing,
            closed: Arc::clone(&closed),
        },
        ServerSide {
            to_client: Some(to_client),
            from_client,
            closed,
        },
    )
}

// ── MockConnector ───────────────────────────────────────────────────

/// Hands out scripted transports in order, then fails every attempt.
#[derive(Clone, Default)]
pub struct MockConnector {
    links: Arc<StdMutex<VecDeque<MockTransport>>>,
    pub attempts: Arc<StdMutex<u32>>,
}

impl MockConnector {
    /// A connector with `count` links ready, plus their server sides.
    pub fn with_links(count: usize) -> (Self, Vec<ServerSide>) {
        let connector = Self::default();
        let mut servers = Vec::with_capacity(count);
        for _ in 0..count {
            let (transport, server) = mock_link();
            connector.links.lock().unwrap().push_back(transport);
            servers.push(server);
        }
        (connector, servers)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> std::result::Result<Box<dyn Transport>, LobbyLinkError> {
        *self.attempts.lock().unwrap() += 1;
        match self.links.lock().unwrap().pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(LobbyLinkError::TransportReceive("connection refused".into())),
        }
    }
}

/// Fast retries so reconnect tests finish quickly.
pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_base_delay(Duration::from_millis(10))
        .with_max_attempts(3)
}

/// Start a client for `user_id` on a single mock link.
pub fn start_client(
    user_id: &str,
    api: Option<Arc<dyn ChatApi>>,
) -> (LobbyLinkClient, mpsc::Receiver<LobbyLinkEvent>, ServerSide) {
    let (connector, mut servers) = MockConnector::with_links(1);
    let registry = TransportRegistry::new(connector, fast_policy());
    let (client, events) = LobbyLinkClient::start(registry, api, LobbyLinkConfig::new(user_id));
    (client, events, servers.remove(0))
}

/// Wait until the watched value satisfies `predicate` and return a copy.
pub async fn wait_view<T: Clone>(rx: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for view")
        .expect("client loop gone")
        .clone()
}

/// Receive events until one matches `predicate`.
pub async fn wait_event(
    events: &mut mpsc::Receiver<LobbyLinkEvent>,
    mut predicate: impl FnMut(&LobbyLinkEvent) -> bool,
) -> LobbyLinkEvent {
    let wait = async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("timed out waiting for event")
}

// ── MockChatApi ─────────────────────────────────────────────────────

/// REST api returning canned answers and recording upload requests.
#[derive(Default)]
pub struct MockChatApi {
    pub pages: StdMutex<VecDeque<HistoryPage>>,
    pub summaries: StdMutex<Vec<ConversationSummary>>,
    pub uploads: StdMutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn fetch_history(
        &self,
        _friend_id: &str,
        _before: Option<&str>,
        _limit: u32,
    ) -> Result<HistoryPage> {
        Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.summaries.lock().unwrap().clone())
    }

    async fn request_upload_target(&self, filename: &str, content_type: &str) -> Result<UploadTarget> {
        self.uploads
            .lock()
            .unwrap()
            .push((filename.to_owned(), content_type.to_owned()));
        Ok(UploadTarget {
            upload_url: format!("https://storage.example.com/upload/{filename}?sig=abc"),
            image_path: format!("chat/u-1/{filename}"),
        })
    }
}

// ── JSON helper functions ───────────────────────────────────────────

/// A lobby member as the server sends it.
pub fn member(user_id: &str, nickname: &str, is_ready: bool) -> Value {
    json!({"user_id": user_id, "nickname": nickname, "is_ready": is_ready})
}

/// A full lobby object.
pub fn lobby(code: &str, host_id: &str, max_players: u8, members: Vec<Value>, status: &str) -> Value {
    json!({
        "lobby_code": code,
        "host_id": host_id,
        "max_players": max_players,
        "is_public": true,
        "game_name": "tictactoe",
        "current_players": members.len(),
        "members": members,
        "status": status,
    })
}

/// A fresh tic-tac-toe state with `first` to move.
pub fn tictactoe_state(first: &str, second: &str, turn_start: DateTime<Utc>) -> Value {
    json!({
        "current_turn": first,
        "players": {first: "X", second: "O"},
        "board": [null, null, null, null, null, null, null, null, null],
        "turn_start_time": turn_start.to_rfc3339(),
        "turn_timeout_seconds": 30,
    })
}

/// A direct message.
pub fn direct_message(id: &str, sender: &str, receiver: &str, content: Option<&str>, image_path: Option<&str>) -> Value {
    let mut message = json!({
        "id": id,
        "sender_id": sender,
        "receiver_id": receiver,
        "created_at": "2026-10-18T09:30:00Z",
    });
    if let Some(content) = content {
        message["content"] = json!(content);
    }
    if let Some(image_path) = image_path {
        message["image_path"] = json!(image_path);
    }
    message
}
