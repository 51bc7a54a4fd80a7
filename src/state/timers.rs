//! Timer registry shared by the state machines.
//!
//! Timers are plain deadlines; nothing here sleeps. The driver asks for the
//! next deadline, waits for it, and calls [`TimerRegistry::fire_due`], which
//! hands back the keys to route to their owning machine.
//!
//! There is at most one timer per [`TimerKey`]. Scheduling a key that already
//! exists replaces the old timer.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Which machine a timer belongs to and what it is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerDomain {
    /// Expiry of a lobby member's typing indicator, keyed by user.
    LobbyTyping,
    /// Expiry of a chat peer's typing indicator, keyed by user.
    ChatTyping,
    /// One-second turn countdown tick.
    TurnClock,
    /// `get_game_state` poll while waiting for a game to appear.
    GameResync,
}

/// `(domain, id)` identifying one timer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub domain: TimerDomain,
    pub id: String,
}

impl TimerKey {
    pub fn new(domain: TimerDomain, id: impl Into<String>) -> Self {
        Self {
            domain,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Instant,
    period: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: BTreeMap<TimerKey, Timer>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire once, `after` from `now`.
    pub fn schedule_once(&mut self, key: TimerKey, after: Duration, now: Instant) {
        self.insert(
            key,
            Timer {
                deadline: now + after,
                period: None,
            },
        );
    }

    /// Fire every `period`, first at `now + period`.
    pub fn schedule_repeating(&mut self, key: TimerKey, period: Duration, now: Instant) {
        let period = period.max(Duration::from_millis(1));
        self.insert(
            key,
            Timer {
                deadline: now + period,
                period: Some(period),
            },
        );
    }

    fn insert(&mut self, key: TimerKey, timer: Timer) {
        if self.timers.insert(key.clone(), timer).is_some() {
            debug!(?key, "timer replaced");
        }
    }

    /// Returns `true` if a timer was removed.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.timers.remove(key).is_some()
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.timers.contains_key(key)
    }

    /// Remove every timer of `domain`.
    pub fn clear_domain(&mut self, domain: TimerDomain) {
        self.timers.retain(|key, _| key.domain != domain);
    }

    /// Remove everything. Called on teardown.
    pub fn clear_all(&mut self) {
        self.timers.clear();
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    /// Collect every timer due at `now`, in deadline order.
    ///
    /// One-shot timers are removed. A repeating timer fires once per call even
    /// if several periods were missed, and is rescheduled past `now`.
    pub fn fire_due(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(Instant, TimerKey)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(k, t)| (t.deadline, k.clone()))
            .collect();
        due.sort();

        for (_, key) in &due {
            let Some(timer) = self.timers.get_mut(key) else {
                continue;
            };
            match timer.period {
                Some(period) => {
                    while timer.deadline <= now {
                        timer.deadline += period;
                    }
                }
                None => {
                    self.timers.remove(key);
                }
            }
        }
        due.into_iter().map(|(_, key)| key).collect()
    }
}
