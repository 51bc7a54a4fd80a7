//! Friend presence and the friend roster.
//!
//! Both are fed from the chat channel but have separate owners:
//! [`ChatServerEvent::route`](crate::protocol::ChatServerEvent::route) sends
//! status events to the [`PresenceAggregator`] and relationship events to the
//! [`FriendRoster`], never both.

use std::collections::BTreeMap;

use tracing::debug;

use crate::protocol::chat::{FriendEvent, FriendRequest, PresenceEvent, PresenceRecord, PresenceStatus};
use crate::protocol::UserId;

/// Merges the per-connection initial batch with later deltas.
///
/// Records are replaced wholesale; the last write for a user wins.
#[derive(Debug, Default)]
pub struct PresenceAggregator {
    records: BTreeMap<UserId, PresenceRecord>,
    epoch: u64,
    seeded_epoch: Option<u64>,
}

impl PresenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new connection was established; the next initial batch is accepted.
    pub fn new_epoch(&mut self) {
        self.epoch += 1;
    }

    /// Returns `true` if the map changed.
    pub fn apply(&mut self, event: PresenceEvent) -> bool {
        match event {
            PresenceEvent::InitialFriendStatuses(statuses) => {
                if self.seeded_epoch == Some(self.epoch) {
                    debug!(epoch = self.epoch, "ignoring repeated initial friend statuses");
                    return false;
                }
                self.seeded_epoch = Some(self.epoch);
                self.records = statuses
                    .into_iter()
                    .map(|record| (record.user_id.clone(), record))
                    .collect();
                true
            }
            PresenceEvent::FriendStatusUpdate(record) => {
                let changed = self.records.get(&record.user_id) != Some(&record);
                self.records.insert(record.user_id.clone(), record);
                changed
            }
        }
    }

    pub fn record(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    /// Unknown users are reported offline.
    pub fn status(&self, user_id: &str) -> PresenceStatus {
        self.records
            .get(user_id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn online_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status != PresenceStatus::Offline)
            .count()
    }

    pub fn records(&self) -> &BTreeMap<UserId, PresenceRecord> {
        &self.records
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Friend {
    pub user_id: UserId,
    pub nickname: String,
    pub avatar_url: Option<String>,
}

/// Friends and incoming friend requests.
#[derive(Debug, Default)]
pub struct FriendRoster {
    friends: BTreeMap<UserId, Friend>,
    requests: Vec<FriendRequest>,
}

impl FriendRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the friend list, e.g. from the profile endpoints.
    pub fn set_friends(&mut self, friends: Vec<Friend>) {
        self.friends = friends
            .into_iter()
            .map(|f| (f.user_id.clone(), f))
            .collect();
    }

    /// Returns `true` if the roster changed.
    pub fn apply(&mut self, event: FriendEvent) -> bool {
        match event {
            FriendEvent::RequestReceived(request) => {
                if self.requests.iter().any(|r| r.request_id == request.request_id) {
                    return false;
                }
                self.requests.push(request);
                true
            }
            FriendEvent::Removed { user_id } => {
                let removed = self.friends.remove(&user_id).is_some();
                let before = self.requests.len();
                self.requests.retain(|r| r.from_user_id != user_id);
                removed || self.requests.len() != before
            }
        }
    }

    /// Drop a request once it was accepted or declined elsewhere.
    pub fn remove_request(&mut self, request_id: &str) -> Option<FriendRequest> {
        let index = self.requests.iter().position(|r| r.request_id == request_id)?;
        Some(self.requests.remove(index))
    }

    pub fn friends(&self) -> impl Iterator<Item = &Friend> {
        self.friends.values()
    }

    pub fn requests(&self) -> &[FriendRequest] {
        &self.requests
    }
}

/// Published copy of presence and roster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceView {
    pub statuses: BTreeMap<UserId, PresenceRecord>,
    pub friends: Vec<Friend>,
    pub requests: Vec<FriendRequest>,
}

impl PresenceView {
    pub fn build(presence: &PresenceAggregator, roster: &FriendRoster) -> Self {
        Self {
            statuses: presence.records().clone(),
            friends: roster.friends().cloned().collect(),
            requests: roster.requests().to_vec(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::chat::{ChatServerEvent, Routed};
    use crate::protocol::ChannelEvent;
    use serde_json::json;

    fn record(user_id: &str, status: PresenceStatus) -> PresenceRecord {
        PresenceRecord {
            user_id: user_id.into(),
            status,
            nickname: None,
            lobby_code: None,
            game_name: None,
        }
    }

    #[test]
    fn initial_batch_once_per_epoch() {
        let mut presence = PresenceAggregator::new();
        presence.new_epoch();
        assert!(presence.apply(PresenceEvent::InitialFriendStatuses(vec![
            record("u-2", PresenceStatus::Online),
            record("u-3", PresenceStatus::InGame),
        ])));
        assert!(!presence.apply(PresenceEvent::InitialFriendStatuses(vec![])));
        assert_eq!(presence.online_count(), 2);

        presence.new_epoch();
        assert!(presence.apply(PresenceEvent::InitialFriendStatuses(vec![record(
            "u-2",
            PresenceStatus::Offline
        )])));
        assert!(presence.record("u-3").is_none());
    }

    #[test]
    fn delta_replaces_whole_record() {
        let mut presence = PresenceAggregator::new();
        let mut in_lobby = record("u-2", PresenceStatus::InLobby);
        in_lobby.lobby_code = Some("K3F9QZ".into());
        presence.apply(PresenceEvent::FriendStatusUpdate(in_lobby));

        let mut in_game = record("u-2", PresenceStatus::InGame);
        in_game.game_name = Some("tictactoe".into());
        presence.apply(PresenceEvent::FriendStatusUpdate(in_game.clone()));

        assert_eq!(presence.record("u-2"), Some(&in_game));
        assert!(presence.record("u-2").is_some_and(|r| r.lobby_code.is_none()));
        assert_eq!(presence.status("u-9"), PresenceStatus::Offline);
    }

    #[test]
    fn friend_removed_touches_roster_only() {
        let mut presence = PresenceAggregator::new();
        let mut roster = FriendRoster::new();
        roster.set_friends(vec![Friend {
            user_id: "u-2".into(),
            nickname: "Brin".into(),
            avatar_url: None,
        }]);
        presence.apply(PresenceEvent::FriendStatusUpdate(record("u-2", PresenceStatus::Online)));

        let event = ChatServerEvent::decode("friend_removed", &json!({"user_id": "u-2"}));
        match event.map(ChatServerEvent::route) {
            Ok(Routed::Friends(friend_event)) => assert!(roster.apply(friend_event)),
            other => panic!("unexpected routing: {other:?}"),
        }
        assert_eq!(roster.friends().count(), 0);
        assert_eq!(presence.status("u-2"), PresenceStatus::Online);
    }

    #[test]
    fn duplicate_friend_requests_are_ignored() {
        let mut roster = FriendRoster::new();
        let request = FriendRequest {
            request_id: "fr-1".into(),
            from_user_id: "u-4".into(),
            nickname: "Dee".into(),
            avatar_url: None,
        };
        assert!(roster.apply(FriendEvent::RequestReceived(request.clone())));
        assert!(!roster.apply(FriendEvent::RequestReceived(request)));
        assert_eq!(roster.requests().len(), 1);
        assert!(roster.remove_request("fr-1").is_some());
        assert!(roster.requests().is_empty());
    }
}
