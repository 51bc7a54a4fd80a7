//! Per-domain channel handle.
//!
//! A [`Channel`] is the only place a logical domain touches the wire: it
//! turns `(event, payload)` into a [`Frame`] on the shared connection and fans
//! incoming frames out to handlers and subscribers. Handles are cheap clones of
//! one shared instance; the [`TransportRegistry`](super::TransportRegistry)
//! guarantees there is exactly one instance per name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{LobbyLinkError, Result};
use crate::protocol::{ChannelEvent, Frame};

/// Connection state of a channel as callers should poll it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    /// Not connected, or explicitly disconnected.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    Connected,
    /// The link dropped and retry `attempt` is pending or in progress.
    Reconnecting { attempt: u32 },
    /// The retry budget is exhausted. Calling `connect` again starts over.
    Failed,
}

impl ChannelStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// What a channel subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// A server event addressed to this channel.
    Event { event: String, data: Value },
    /// The channel's connection status changed.
    Status(ChannelStatus),
}

/// Callback registered with [`Channel::on`].
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`Channel::on`], used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Outgoing queue of the current shared connection, if one is open.
pub(crate) type Outbox = Mutex<Option<mpsc::UnboundedSender<Frame>>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ChannelInner {
    name: String,
    active: AtomicBool,
    status: Mutex<ChannelStatus>,
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChannelMessage>>>,
    next_handler: AtomicU64,
    outbox: Arc<Outbox>,
}

/// Handle to one logical channel on the shared connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, outbox: Arc<Outbox>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                active: AtomicBool::new(false),
                status: Mutex::new(ChannelStatus::Disconnected),
                handlers: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                outbox,
            }),
        }
    }

    /// Domain name of this channel.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current connection status. Connecting is asynchronous; poll this (or
    /// watch [`ChannelMessage::Status`]) instead of assuming success.
    pub fn status(&self) -> ChannelStatus {
        *lock(&self.inner.status)
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Whether `connect` was called and `disconnect` has not been since.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Send `event` with a serializable payload.
    ///
    /// While the shared link is reconnecting the frame is queued and flushed
    /// in order once it is back.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::NotConnected`] if the channel was never connected,
    /// has been disconnected, or the shared connection has been released.
    pub fn emit(&self, event: &str, payload: impl Serialize) -> Result<()> {
        let data = serde_json::to_value(payload)?;
        self.send_frame(Frame::new(self.inner.name.clone(), event, data))
    }

    /// Send a typed channel event.
    ///
    /// # Errors
    ///
    /// Same as [`emit`](Self::emit).
    pub fn emit_event<E: ChannelEvent>(&self, event: &E) -> Result<()> {
        let (name, data) = event.encode()?;
        self.send_frame(Frame::new(self.inner.name.clone(), name, data))
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_active() {
            return Err(LobbyLinkError::NotConnected(self.inner.name.clone()));
        }
        let outbox = lock(&self.inner.outbox);
        let Some(tx) = outbox.as_ref() else {
            return Err(LobbyLinkError::NotConnected(self.inner.name.clone()));
        };
        debug!(channel = %frame.channel, event = %frame.event, "emit");
        tx.send(frame)
            .map_err(|_| LobbyLinkError::NotConnected(self.inner.name.clone()))
    }

    /// Register `handler` for `event`.
    pub fn on(&self, event: impl Into<String>, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.handlers)
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered for `event`.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Stream every event and status change of this channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    pub(crate) fn set_active(&self, active: bool) -> bool {
        self.inner.active.swap(active, Ordering::AcqRel)
    }

    pub(crate) fn set_status(&self, status: ChannelStatus) {
        {
            let mut current = lock(&self.inner.status);
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!(channel = %self.inner.name, ?status, "channel status");
        self.broadcast(ChannelMessage::Status(status));
    }

    pub(crate) fn dispatch(&self, event: &str, data: &Value) {
        let handlers: Vec<Handler> = lock(&self.inner.handlers)
            .get(event)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(data);
        }
        self.broadcast(ChannelMessage::Event {
            event: event.to_owned(),
            data: data.clone(),
        });
    }

    fn broadcast(&self, message: ChannelMessage) {
        lock(&self.inner.subscribers).retain(|tx| tx.send(message.clone()).is_ok());
    }

    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("active", &self.is_active())
            .field("status", &self.status())
            .finish()
    }
}
