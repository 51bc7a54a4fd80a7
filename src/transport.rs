//! Transport abstraction for the shared real-time connection.
//!
//! The [`Transport`] trait is a bidirectional text message pipe. Every frame
//! of every logical channel travels through one transport, so implementations
//! only ever see opaque JSON strings; framing (WebSocket frames, length
//! prefixes, ...) is their own business.
//!
//! Opening a transport is the job of a [`Connector`]. The
//! [`TransportRegistry`](crate::channel::TransportRegistry) calls it for the
//! initial connect and again for every reconnect attempt.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use lobbylink_client::error::LobbyLinkError;
//! use lobbylink_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), LobbyLinkError> {
//!         // Send the JSON text frame over your transport
//!         Ok(())
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, LobbyLinkError>> {
//!         // Return None when the connection is closed cleanly
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), LobbyLinkError> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::LobbyLinkError;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame and
/// each call to [`recv`](Transport::recv) returns one.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the connection
/// task uses it inside `tokio::select!`. Channel-based implementations (e.g.
/// wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyLinkError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, message: String) -> Result<(), LobbyLinkError>;

    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, LobbyLinkError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), LobbyLinkError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), LobbyLinkError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, LobbyLinkError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), LobbyLinkError> {
        (**self).close().await
    }
}

/// Opens a fresh [`Transport`] to the platform server.
///
/// Called once per connection attempt; a failed attempt is retried by the
/// registry according to its [`ReconnectPolicy`](crate::channel::ReconnectPolicy).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection.
    ///
    /// # Errors
    ///
    /// Any error is treated as a `connect_error`: logged, then retried.
    async fn connect(&self) -> Result<Box<dyn Transport>, LobbyLinkError>;
}
