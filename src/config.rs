//! Client configuration.

use std::time::Duration;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_TYPING_EXPIRY: Duration = Duration::from_secs(3);
const DEFAULT_TYPING_THROTTLE: Duration = Duration::from_secs(2);
const DEFAULT_RESYNC_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_CHAT_PAGE_SIZE: u32 = 30;
const DEFAULT_LOBBY_MESSAGE_LIMIT: u32 = 50;

/// Configuration for a [`LobbyLinkClient`](crate::LobbyLinkClient).
///
/// The only required field is the local user's id; everything else has a
/// default.
///
/// ```
/// use lobbylink_client::LobbyLinkConfig;
/// use std::time::Duration;
///
/// let config = LobbyLinkConfig::new("u-1")
///     .with_event_channel_capacity(512)
///     .with_request_timeout(Duration::from_secs(5));
/// assert_eq!(config.local_user_id, "u-1");
/// assert_eq!(config.typing_expiry, Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct LobbyLinkConfig {
    /// Id of the signed-in user. Decides "is mine", host checks and turns.
    pub local_user_id: String,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, events are dropped (with a warning)
    /// rather than stalling the loop. `Disconnected` is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long [`shutdown`](crate::LobbyLinkClient::shutdown) waits for the
    /// loop before aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// How long a request may wait for its reply before it is failed with a
    /// timeout. Defaults to **15 seconds**.
    pub request_timeout: Duration,
    /// Lifetime of a typing indicator without a fresh typing event.
    /// Defaults to **3 seconds**.
    pub typing_expiry: Duration,
    /// Minimum gap between two outgoing `typing` events for one
    /// conversation. Defaults to **2 seconds**.
    pub typing_throttle: Duration,
    /// Interval of the `get_game_state` poll while no game is visible.
    /// Defaults to **2 seconds**.
    pub resync_poll_interval: Duration,
    /// Granularity of the loop's housekeeping tick (request timeouts).
    /// Defaults to **250 ms**.
    pub tick_interval: Duration,
    /// Messages requested per chat history page. Defaults to **30**.
    pub chat_page_size: u32,
    /// Messages requested by lobby history fetches. Defaults to **50**.
    pub lobby_message_limit: u32,
}

impl LobbyLinkConfig {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            typing_expiry: DEFAULT_TYPING_EXPIRY,
            typing_throttle: DEFAULT_TYPING_THROTTLE,
            resync_poll_interval: DEFAULT_RESYNC_POLL_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            chat_page_size: DEFAULT_CHAT_PAGE_SIZE,
            lobby_message_limit: DEFAULT_LOBBY_MESSAGE_LIMIT,
        }
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// A zero timeout aborts the loop immediately on shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_typing_expiry(mut self, expiry: Duration) -> Self {
        self.typing_expiry = expiry;
        self
    }

    #[must_use]
    pub fn with_typing_throttle(mut self, throttle: Duration) -> Self {
        self.typing_throttle = throttle;
        self
    }

    #[must_use]
    pub fn with_resync_poll_interval(mut self, interval: Duration) -> Self {
        self.resync_poll_interval = interval;
        self
    }

    /// Values below 10 ms are clamped to 10 ms.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_chat_page_size(mut self, size: u32) -> Self {
        self.chat_page_size = size.max(1);
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_lobby_message_limit(mut self, limit: u32) -> Self {
        self.lobby_message_limit = limit.max(1);
        self
    }
}
