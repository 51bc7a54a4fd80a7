//! # LobbyLink Client
//!
//! Real-time state synchronization for a multiplayer lobby, game and chat
//! platform.
//!
//! One shared connection carries three logical channels (`lobby`, `game`,
//! `chat`). Each channel feeds a state machine that reduces server pushes into
//! one authoritative snapshot; user intents go back out through the same
//! machines, which track every request until the server confirms or rejects
//! it.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for
//!   any backend; the registry handles reconnects with backoff and jitter
//! - **WebSocket built-in**: default `transport-websocket` feature provides
//!   `WebSocketConnector`
//! - **REST companion**: default `rest-api` feature provides `HttpChatApi`
//!   for chat history and attachment uploads
//! - **Observable**: snapshots are published through `tokio::sync::watch`,
//!   one-off occurrences as [`LobbyLinkEvent`]s
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lobbylink_client::{
//!     LobbyLinkClient, LobbyLinkConfig, LobbyLinkEvent, ReconnectPolicy, TransportRegistry,
//! };
//! use lobbylink_client::transports::WebSocketConnector;
//!
//! # async fn run() -> lobbylink_client::error::Result<()> {
//! let registry = TransportRegistry::new(
//!     WebSocketConnector::new("wss://play.example.com/ws"),
//!     ReconnectPolicy::default(),
//! );
//! let (client, mut events) =
//!     LobbyLinkClient::start(registry, None, LobbyLinkConfig::new("u-1"));
//!
//! client.join_lobby("K3F9QZ").await?;
//! while let Some(event) = events.recv().await {
//!     if let LobbyLinkEvent::Disconnected { .. } = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod channel;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use api::{ApiConfig, ChatApi};
pub use channel::{Channel, ChannelStatus, ReconnectPolicy, TransportRegistry};
pub use client::LobbyLinkClient;
pub use config::LobbyLinkConfig;
pub use coordinator::Route;
pub use error::LobbyLinkError;
pub use error_codes::ErrorCode;
pub use event::LobbyLinkEvent;
pub use protocol::Frame;
pub use transport::{Connector, Transport};

#[cfg(feature = "rest-api")]
pub use api::HttpChatApi;

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
