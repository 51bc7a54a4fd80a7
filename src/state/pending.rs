//! Pending-request correlation table.
//!
//! Every intent that expects a server reply registers an entry here before it
//! emits. The entry is cleared by a success event, by an error event, or by
//! [`PendingRequests::sweep`] once it has waited longer than the request
//! timeout, so a loading flag can never be left behind.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{LobbyLinkError, Result};

/// A kind of request a machine correlates.
pub trait RequestKind: Copy + Eq + fmt::Debug {
    /// Wire name of the emit that starts the request.
    fn name(self) -> &'static str;

    /// Events that complete this request whatever their payload.
    ///
    /// Requests completed only by some instances of an event (for example an
    /// echo of the local user's own message) resolve them explicitly instead.
    fn resolved_by(self) -> &'static [&'static str];

    /// Whether a second request of this kind may be in flight at once.
    fn allows_concurrent(self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry<K> {
    kind: K,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequests<K> {
    entries: Vec<Entry<K>>,
}

impl<K> Default for PendingRequests<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: RequestKind> PendingRequests<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request started at `now`.
    ///
    /// # Errors
    ///
    /// [`LobbyLinkError::RequestPending`] if an exclusive request of the same
    /// kind is already in flight.
    pub fn begin(&mut self, kind: K, now: Instant) -> Result<()> {
        if !kind.allows_concurrent() && self.is_pending(kind) {
            return Err(LobbyLinkError::RequestPending(kind.name()));
        }
        self.entries.push(Entry { kind, started: now });
        Ok(())
    }

    /// Complete the oldest request of `kind`. Returns `false` if none was open.
    pub fn resolve(&mut self, kind: K) -> bool {
        match self.entries.iter().position(|e| e.kind == kind) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Withdraw the newest request of `kind`, for an emit that never left.
    pub fn abandon(&mut self, kind: K) -> bool {
        match self.entries.iter().rposition(|e| e.kind == kind) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Complete every request that `event` resolves. Returns the kinds cleared.
    pub fn resolve_on(&mut self, event: &str) -> Vec<K> {
        let mut cleared = Vec::new();
        self.entries.retain(|e| {
            let hit = e.kind.resolved_by().contains(&event);
            if hit && !cleared.contains(&e.kind) {
                cleared.push(e.kind);
            }
            !hit
        });
        cleared
    }

    pub fn is_pending(&self, kind: K) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    /// `true` while anything is in flight.
    pub fn is_loading(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Kinds currently in flight, oldest first, without duplicates.
    pub fn kinds(&self) -> Vec<K> {
        let mut kinds: Vec<K> = Vec::new();
        for entry in &self.entries {
            if !kinds.contains(&entry.kind) {
                kinds.push(entry.kind);
            }
        }
        kinds
    }

    /// Drop every entry, e.g. on an error event or a hard reset.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove and return every request older than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<K> {
        let mut expired = Vec::new();
        self.entries.retain(|e| {
            let stale = now.saturating_duration_since(e.started) >= timeout;
            if stale {
                expired.push(e.kind);
            }
            !stale
        });
        expired
    }
}
