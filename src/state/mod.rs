//! Client-side state machines.
//!
//! Every machine is a synchronous reducer: it owns its snapshot, takes an
//! intent or a decoded server event plus the current [`Now`], and returns a
//! [`Step`] describing what to put on the wire and what to tell the UI. None of
//! them touch a channel or spawn anything; the driver in [`crate::client`]
//! applies the step. Timers are shared through one [`TimerRegistry`] the driver
//! lends to whichever machine is running.

pub mod chat;
pub mod game;
pub mod lobby;
pub mod pending;
pub mod presence;
pub mod timers;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub use chat::{ChatEngine, ChatMessage, ChatNotice, ChatView, Conversation, DeliveryState, PageRequest};
pub use game::{GameContext, GameEngine, GameNotice, GamePhase, GameView, MoveValidator, TicTacToe};
pub use lobby::{LobbyError, LobbyMachine, LobbyNotice, LobbyPhase, LobbySnapshot, LobbyView, Member};
pub use pending::{PendingRequests, RequestKind};
pub use presence::{Friend, FriendRoster, PresenceAggregator, PresenceView};
pub use timers::{TimerDomain, TimerKey, TimerRegistry};

/// A point in time as seen by the reducers.
///
/// `instant` drives timers and request timeouts; `wall` is compared against
/// server timestamps such as `turn_start_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

impl Now {
    /// Read both clocks.
    pub fn current() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// Shift both clocks forward by `by`.
    #[must_use]
    pub fn advanced(self, by: std::time::Duration) -> Self {
        let wall = chrono::Duration::from_std(by)
            .ok()
            .and_then(|d| self.wall.checked_add_signed(d))
            .unwrap_or(self.wall);
        Self {
            instant: self.instant + by,
            wall,
        }
    }
}

/// Result of one reducer step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step<E, N> {
    /// Events to emit on the machine's channel, in order.
    pub emits: Vec<E>,
    /// Occurrences worth surfacing to the UI.
    pub notices: Vec<N>,
}

impl<E, N> Default for Step<E, N> {
    fn default() -> Self {
        Self {
            emits: Vec::new(),
            notices: Vec::new(),
        }
    }
}

impl<E, N> Step<E, N> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(event: E) -> Self {
        Self {
            emits: vec![event],
            notices: Vec::new(),
        }
    }

    pub fn notice(notice: N) -> Self {
        Self {
            emits: Vec::new(),
            notices: vec![notice],
        }
    }

    #[must_use]
    pub fn with_emit(mut self, event: E) -> Self {
        self.emits.push(event);
        self
    }

    #[must_use]
    pub fn with_notice(mut self, notice: N) -> Self {
        self.notices.push(notice);
        self
    }

    pub fn merge(&mut self, other: Self) {
        self.emits.extend(other.emits);
        self.notices.extend(other.notices);
    }

    pub fn is_empty(&self) -> bool {
        self.emits.is_empty() && self.notices.is_empty()
    }
}
