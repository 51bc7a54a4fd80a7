//! Transport Registry: one shared connection, one [`Channel`] per domain.
//!
//! The registry is the only component that opens or closes the underlying
//! connection. The first `connect` of any channel spawns the connection task;
//! the last `disconnect` shuts it down. In between the task reconnects on its
//! own, following the [`ReconnectPolicy`], and mirrors its status onto every
//! active channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::policy::ReconnectPolicy;
use super::session::{lock, Channel, ChannelStatus, Outbox};
use crate::protocol::Frame;
use crate::transport::{Connector, Transport};

/// How long `disconnect` waits for the connection task to close cleanly.
const LINK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared between the registry handle and the connection task.
struct Shared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    channels: Mutex<HashMap<String, Channel>>,
    link_status: Mutex<ChannelStatus>,
    outbox: Arc<Outbox>,
}

impl Shared {
    fn set_link_status(&self, status: ChannelStatus) {
        *lock(&self.link_status) = status;
        for channel in self.active_channels() {
            channel.set_status(status);
        }
    }

    fn link_status(&self) -> ChannelStatus {
        *lock(&self.link_status)
    }

    fn active_channels(&self) -> Vec<Channel> {
        lock(&self.channels)
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    fn route(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(raw = %text, "dropping undecodable frame: {e}");
                return;
            }
        };
        let channel = lock(&self.channels).get(&frame.channel).cloned();
        match channel {
            Some(channel) if channel.is_active() => channel.dispatch(&frame.event, &frame.data),
            _ => debug!(channel = %frame.channel, event = %frame.event, "no active channel, frame dropped"),
        }
    }
}

struct Link {
    task: tokio::task::JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

/// Lazily creates channels and owns the shared connection.
///
/// Cloning the registry yields another handle to the same connection.
#[derive(Clone)]
pub struct TransportRegistry {
    shared: Arc<Shared>,
    link: Arc<tokio::sync::Mutex<Option<Link>>>,
}

impl TransportRegistry {
    /// Create a registry. Nothing is dialled until the first `connect`.
    pub fn new(connector: impl Connector, policy: ReconnectPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector: Arc::new(connector),
                policy,
                channels: Mutex::new(HashMap::new()),
                link_status: Mutex::new(ChannelStatus::Disconnected),
                outbox: Arc::new(Mutex::new(None)),
            }),
            link: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Return the channel for `name`, creating it on first use.
    pub fn channel(&self, name: &str) -> Channel {
        lock(&self.shared.channels)
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!(channel = %name, "channel created");
                Channel::new(name, Arc::clone(&self.shared.outbox))
            })
            .clone()
    }

    /// Activate `name`, opening the shared connection if needed.
    ///
    /// Idempotent: connecting an active channel on a live connection is a
    /// no-op. After the retry budget was exhausted this starts a fresh
    /// connection cycle.
    pub async fn connect(&self, name: &str) -> Channel {
        let channel = self.channel(name);
        let mut link = self.link.lock().await;
        let alive = link.as_ref().is_some_and(|l| !l.task.is_finished());

        if channel.is_active() && alive {
            return channel;
        }
        channel.set_active(true);

        if !alive {
            *link = Some(self.spawn_link());
        }
        channel.set_status(self.shared.link_status());
        info!(channel = %name, "channel connected");
        channel
    }

    /// Deactivate `name`. Releases the shared connection once no channel is
    /// active any more.
    pub async fn disconnect(&self, name: &str) {
        let Some(channel) = lock(&self.shared.channels).get(name).cloned() else {
            return;
        };
        if !channel.set_active(false) {
            return;
        }
        channel.set_status(ChannelStatus::Disconnected);
        info!(channel = %name, "channel disconnected");

        if self.shared.active_channels().is_empty() {
            let taken = self.link.lock().await.take();
            if let Some(link) = taken {
                self.release(link).await;
            }
        }
    }

    /// Disconnect every channel and release the connection.
    pub async fn shutdown(&self) {
        let names: Vec<String> = lock(&self.shared.channels).keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    /// Status of the shared connection itself.
    pub fn connection_status(&self) -> ChannelStatus {
        self.shared.link_status()
    }

    /// Names of channels currently connected by a consumer.
    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .active_channels()
            .iter()
            .map(|c| c.name().to_owned())
            .collect();
        names.sort();
        names
    }

    /// Whether the connection task is running.
    pub async fn is_connection_open(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    fn spawn_link(&self) -> Link {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outbox) = Some(out_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shared.set_link_status(ChannelStatus::Connecting);
        let task = tokio::spawn(run_link(Arc::clone(&self.shared), out_rx, shutdown_rx));
        Link {
            task,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    async fn release(&self, mut link: Link) {
        debug!("releasing shared connection");
        *lock(&self.shared.outbox) = None;
        if let Some(tx) = link.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(LINK_SHUTDOWN_TIMEOUT, &mut link.task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => warn!("connection task terminated with join error: {join_err}"),
            Err(_) => {
                warn!("connection task did not exit within timeout; aborting");
                link.task.abort();
            }
        }
        *lock(&self.shared.link_status) = ChannelStatus::Disconnected;
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("status", &self.connection_status())
            .field("active_channels", &self.active_channels())
            .finish()
    }
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

/// Connection task: connect, pump frames, reconnect with backoff.
async fn run_link(
    shared: Arc<Shared>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let policy = shared.policy.clone();
    let mut attempt: u32 = 0;
    let mut unsent: Option<String> = None;

    loop {
        let connect = tokio::time::timeout(policy.connect_timeout, shared.connector.connect());
        let outcome = tokio::select! {
            outcome = connect => outcome,
            _ = &mut shutdown_rx => {
                shared.set_link_status(ChannelStatus::Disconnected);
                return;
            }
        };

        let mut transport = match outcome {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!("connect_error: {e}");
                attempt += 1;
                if !wait_before_retry(&shared, &policy, attempt, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
            Err(_) => {
                warn!("connect_error: attempt timed out after {:?}", policy.connect_timeout);
                attempt += 1;
                if !wait_before_retry(&shared, &policy, attempt, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
        };

        attempt = 0;
        shared.set_link_status(ChannelStatus::Connected);
        info!("shared connection established");

        match pump(&mut transport, &shared, &mut out_rx, &mut shutdown_rx, &mut unsent).await {
            PumpExit::Shutdown => {
                let _ = transport.close().await;
                shared.set_link_status(ChannelStatus::Disconnected);
                debug!("connection task exited");
                return;
            }
            PumpExit::Lost(reason) => {
                warn!("shared connection lost: {reason}");
                attempt += 1;
                if !wait_before_retry(&shared, &policy, attempt, &mut shutdown_rx).await {
                    return;
                }
            }
        }
    }
}

/// Sleep out the backoff for `attempt`. Returns `false` if the task must exit.
async fn wait_before_retry(
    shared: &Shared,
    policy: &ReconnectPolicy,
    attempt: u32,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    if !policy.allows(attempt) {
        error!(
            "reconnect budget of {} attempts exhausted; giving up",
            policy.max_attempts
        );
        shared.set_link_status(ChannelStatus::Failed);
        return false;
    }
    shared.set_link_status(ChannelStatus::Reconnecting { attempt });
    let delay = policy.next_delay(attempt);
    debug!(attempt, ?delay, "waiting before reconnect");
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx => {
            shared.set_link_status(ChannelStatus::Disconnected);
            false
        }
    }
}

async fn pump(
    transport: &mut Box<dyn Transport>,
    shared: &Shared,
    out_rx: &mut mpsc::UnboundedReceiver<Frame>,
    shutdown_rx: &mut oneshot::Receiver<()>,
    unsent: &mut Option<String>,
) -> PumpExit {
    if let Some(text) = unsent.take() {
        if let Err(e) = transport.send(text.clone()).await {
            *unsent = Some(text);
            return PumpExit::Lost(format!("transport send error: {e}"));
        }
    }

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    return PumpExit::Shutdown;
                };
                match frame.to_text() {
                    Ok(text) => {
                        if let Err(e) = transport.send(text.clone()).await {
                            *unsent = Some(text);
                            return PumpExit::Lost(format!("transport send error: {e}"));
                        }
                    }
                    Err(e) => error!("failed to serialize frame: {e}"),
                }
            }
            _ = &mut *shutdown_rx => return PumpExit::Shutdown,
            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => shared.route(&text),
                Some(Err(e)) => return PumpExit::Lost(format!("transport receive error: {e}")),
                None => return PumpExit::Lost("closed by server".into()),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::channel::ChannelMessage;
    use crate::error::LobbyLinkError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory transport: the test holds the other ends of both pipes.
    struct PipeTransport {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn send(&mut self, message: String) -> Result<(), LobbyLinkError> {
            self.outbound
                .send(message)
                .map_err(|e| LobbyLinkError::TransportSend(e.to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String, LobbyLinkError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), LobbyLinkError> {
            Ok(())
        }
    }

    struct PipeConnector {
        server: Mutex<Option<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>>,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, LobbyLinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match lock(&self.server).take() {
                Some((inbound, outbound)) => Ok(Box::new(PipeTransport { inbound, outbound })),
                None => Err(LobbyLinkError::TransportClosed),
            }
        }
    }

    struct ServerEnd {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    fn registry(policy: ReconnectPolicy) -> (TransportRegistry, ServerEnd, Arc<AtomicUsize>) {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = PipeConnector {
            server: Mutex::new(Some((inbound, outbound))),
            attempts: Arc::clone(&attempts),
        };
        (
            TransportRegistry::new(connector, policy),
            ServerEnd {
                to_client,
                from_client,
            },
            attempts,
        )
    }

    async fn wait_for(channel: &Channel, status: ChannelStatus) {
        for _ in 0..200 {
            if channel.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("channel never reached {status:?}, still {:?}", channel.status());
    }

    #[tokio::test]
    async fn same_name_returns_same_instance() {
        let (registry, _server, _) = registry(ReconnectPolicy::default());
        let a = registry.channel("lobby");
        let b = registry.channel("lobby");
        let c = registry.channel("game");
        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_shares_one_connection() {
        let (registry, _server, attempts) = registry(ReconnectPolicy::default());
        let lobby = registry.connect("lobby").await;
        wait_for(&lobby, ChannelStatus::Connected).await;
        registry.connect("lobby").await;
        let game = registry.connect("game").await;
        assert_eq!(game.status(), ChannelStatus::Connected);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_channels(), vec!["game", "lobby"]);
    }

    #[tokio::test]
    async fn frames_are_routed_by_channel_name() {
        let (registry, mut server, _) = registry(ReconnectPolicy::default());
        let lobby = registry.connect("lobby").await;
        let game = registry.connect("game").await;
        let mut lobby_rx = lobby.subscribe();
        wait_for(&lobby, ChannelStatus::Connected).await;

        server
            .to_client
            .send(r#"{"channel":"game","event":"game_state","data":{}}"#.into())
            .unwrap();
        server
            .to_client
            .send(r#"{"channel":"lobby","event":"lobby_left"}"#.into())
            .unwrap();

        let event = loop {
            match lobby_rx.recv().await.unwrap() {
                ChannelMessage::Event { event, .. } => break event,
                ChannelMessage::Status(_) => continue,
            }
        };
        assert_eq!(event, "lobby_left");

        game.emit("get_game_state", json!({})).unwrap();
        let sent = server.from_client.recv().await.unwrap();
        let frame = Frame::parse(&sent).unwrap();
        assert_eq!(frame.channel, "game");
        assert_eq!(frame.event, "get_game_state");
    }

    #[tokio::test]
    async fn last_disconnect_releases_connection() {
        let (registry, _server, _) = registry(ReconnectPolicy::default());
        let lobby = registry.connect("lobby").await;
        registry.connect("chat").await;
        wait_for(&lobby, ChannelStatus::Connected).await;

        registry.disconnect("lobby").await;
        assert!(registry.is_connection_open().await);
        assert_eq!(lobby.status(), ChannelStatus::Disconnected);
        assert!(lobby.emit("get_lobby", json!({})).is_err());

        registry.disconnect("chat").await;
        assert!(!registry.is_connection_open().await);
        assert_eq!(registry.connection_status(), ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn exhausted_budget_marks_channels_failed() {
        let (registry, server, attempts) = registry(
            ReconnectPolicy::default()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter_ratio(0.0),
        );
        let lobby = registry.connect("lobby").await;
        wait_for(&lobby, ChannelStatus::Connected).await;

        // Dropping the server end closes the only transport; later attempts fail.
        drop(server);
        wait_for(&lobby, ChannelStatus::Failed).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!registry.is_connection_open().await);
    }
}
