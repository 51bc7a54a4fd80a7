//! Direct-message synchronization.
//!
//! Conversations are keyed by the friend's user id. Outgoing messages appear
//! at once as a pending local echo and are confirmed in place when the server
//! relays them back. Incoming messages are deduplicated by id, so a message
//! seen through both `message` and `conversation_updated` counts once.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::timers::{TimerDomain, TimerKey, TimerRegistry};
use super::{Now, Step};
use crate::error::{LobbyLinkError, Result};
use crate::protocol::chat::{ConversationEvent, ConversationSummary, DirectMessage, HistoryPage};
use crate::protocol::{ChatClientEvent, UserId};

pub type ChatStep = Step<ChatClientEvent, ChatNotice>;

/// Prefix of ids given to local echoes before the server assigns one.
pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Local echo not yet relayed back by the server.
    Pending,
    Delivered,
    /// The emit could not be queued.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: UserId,
    /// Decided from `sender_id` on receipt.
    pub is_mine: bool,
    pub content: Option<String>,
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl ChatMessage {
    fn from_wire(message: DirectMessage, local_user_id: &str) -> Self {
        Self {
            is_mine: message.sender_id == local_user_id,
            id: message.id,
            sender_id: message.sender_id,
            content: message.content.filter(|c| !c.is_empty()),
            image_path: message.image_path,
            created_at: message.created_at,
            delivery: DeliveryState::Delivered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub friend_id: UserId,
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
    /// Oldest first, ids unique.
    pub messages: Vec<ChatMessage>,
    /// Foreign messages received since the conversation was last opened.
    /// Messages arriving while it is the active one count too; opening it
    /// again clears them.
    pub unread: u32,
    /// Cursor for the next older page; `None` before the first page.
    pub cursor: Option<String>,
    pub has_more: bool,
    pub loading_more: bool,
    pub peer_typing: bool,
}

impl Conversation {
    fn new(friend_id: UserId) -> Self {
        Self {
            friend_id,
            nickname: None,
            avatar_url: None,
            messages: Vec::new(),
            unread: 0,
            cursor: None,
            has_more: true,
            loading_more: false,
            peer_typing: false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Insert after every message not newer than `message`.
    fn insert_ordered(&mut self, message: ChatMessage) {
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatView {
    pub conversations: BTreeMap<UserId, Conversation>,
    pub active: Option<UserId>,
    pub total_unread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatNotice {
    /// A new message from a friend.
    Incoming {
        friend_id: UserId,
        message: ChatMessage,
    },
    HistoryFailed {
        friend_id: UserId,
        message: String,
    },
}

/// A history fetch the driver must run against the REST api.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub friend_id: UserId,
    pub before: Option<String>,
    pub limit: u32,
    generation: u64,
}

/// Reject anything but a named image upload.
///
/// # Errors
///
/// [`LobbyLinkError::InvalidAttachment`] describing the problem.
pub fn check_attachment(filename: &str, content_type: &str) -> Result<()> {
    if filename.trim().is_empty() {
        return Err(LobbyLinkError::InvalidAttachment("filename is empty".into()));
    }
    if !content_type.starts_with("image/") || content_type.len() == "image/".len() {
        return Err(LobbyLinkError::InvalidAttachment(format!(
            "`{content_type}` is not an image type"
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ChatEngine {
    local_user_id: UserId,
    typing_expiry: Duration,
    typing_throttle: Duration,
    page_size: u32,
    conversations: BTreeMap<UserId, Conversation>,
    active: Option<UserId>,
    generations: HashMap<UserId, u64>,
    typing_sent: HashMap<UserId, Instant>,
}

impl ChatEngine {
    pub fn new(
        local_user_id: impl Into<UserId>,
        typing_expiry: Duration,
        typing_throttle: Duration,
        page_size: u32,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            typing_expiry,
            typing_throttle,
            page_size,
            conversations: BTreeMap::new(),
            active: None,
            generations: HashMap::new(),
            typing_sent: HashMap::new(),
        }
    }

    pub fn conversation(&self, friend_id: &str) -> Option<&Conversation> {
        self.conversations.get(friend_id)
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn view(&self) -> ChatView {
        ChatView {
            conversations: self.conversations.clone(),
            active: self.active.clone(),
            total_unread: self.conversations.values().map(|c| c.unread).sum(),
        }
    }

    /// Create the conversation if missing. An existing one is left untouched.
    /// Returns `true` if it was created.
    pub fn ensure_conversation(
        &mut self,
        friend_id: &str,
        nickname: Option<String>,
        avatar_url: Option<String>,
    ) -> bool {
        if self.conversations.contains_key(friend_id) {
            return false;
        }
        let mut conversation = Conversation::new(friend_id.to_owned());
        conversation.nickname = nickname;
        conversation.avatar_url = avatar_url;
        self.conversations.insert(friend_id.to_owned(), conversation);
        true
    }

    /// Make `friend_id` the active conversation and mark it read.
    pub fn open_conversation(&mut self, friend_id: &str) {
        self.ensure_conversation(friend_id, None, None);
        if let Some(conversation) = self.conversations.get_mut(friend_id) {
            conversation.unread = 0;
        }
        self.active = Some(friend_id.to_owned());
    }

    pub fn close_conversation(&mut self) {
        self.active = None;
    }

    /// Append a pending echo and emit the message.
    pub fn send_message(
        &mut self,
        friend_id: &str,
        text: Option<&str>,
        image_path: Option<String>,
        now: Now,
    ) -> Result<(String, ChatStep)> {
        let content = text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_owned);
        let image_path = image_path.filter(|p| !p.is_empty());
        if content.is_none() && image_path.is_none() {
            return Err(LobbyLinkError::EmptyMessage);
        }
        let conversation = self
            .conversations
            .get_mut(friend_id)
            .ok_or_else(|| LobbyLinkError::UnknownConversation(friend_id.to_owned()))?;

        let local_id = format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4());
        conversation.messages.push(ChatMessage {
            id: local_id.clone(),
            sender_id: self.local_user_id.clone(),
            is_mine: true,
            content: content.clone(),
            image_path: image_path.clone(),
            created_at: now.wall,
            delivery: DeliveryState::Pending,
        });
        Ok((
            local_id,
            Step::emit(ChatClientEvent::SendMessage {
                friend_user_id: friend_id.to_owned(),
                content,
                image_path,
            }),
        ))
    }

    /// Mark a local echo whose emit failed.
    pub fn mark_failed(&mut self, friend_id: &str, local_id: &str) {
        let message = self
            .conversations
            .get_mut(friend_id)
            .and_then(|c| c.messages.iter_mut().find(|m| m.id == local_id));
        if let Some(message) = message {
            message.delivery = DeliveryState::Failed;
        }
    }

    /// Emit `typing`, at most once per throttle window per conversation.
    pub fn send_typing(&mut self, friend_id: &str, now: Instant) -> Result<ChatStep> {
        if !self.conversations.contains_key(friend_id) {
            return Err(LobbyLinkError::UnknownConversation(friend_id.to_owned()));
        }
        if let Some(last) = self.typing_sent.get(friend_id) {
            if now.saturating_duration_since(*last) < self.typing_throttle {
                return Ok(Step::none());
            }
        }
        self.typing_sent.insert(friend_id.to_owned(), now);
        Ok(Step::emit(ChatClientEvent::Typing {
            friend_user_id: friend_id.to_owned(),
        }))
    }

    /// Start fetching the next older page. Supersedes any page in flight.
    /// Returns `None` once the beginning of the conversation was reached.
    pub fn load_more(&mut self, friend_id: &str) -> Result<Option<PageRequest>> {
        let conversation = self
            .conversations
            .get_mut(friend_id)
            .ok_or_else(|| LobbyLinkError::UnknownConversation(friend_id.to_owned()))?;
        if !conversation.has_more {
            return Ok(None);
        }
        conversation.loading_more = true;
        let generation = self.generations.entry(friend_id.to_owned()).or_insert(0);
        *generation += 1;
        Ok(Some(PageRequest {
            friend_id: friend_id.to_owned(),
            before: conversation.cursor.clone(),
            limit: self.page_size,
            generation: *generation,
        }))
    }

    /// Merge a fetched page. Results of superseded requests are dropped.
    pub fn apply_page(&mut self, request: &PageRequest, result: Result<HistoryPage>) -> ChatStep {
        if self.generations.get(&request.friend_id) != Some(&request.generation) {
            debug!(friend_id = %request.friend_id, "dropping superseded history page");
            return Step::none();
        }
        let Some(conversation) = self.conversations.get_mut(&request.friend_id) else {
            return Step::none();
        };
        conversation.loading_more = false;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!(friend_id = %request.friend_id, "history fetch failed: {e}");
                return Step::notice(ChatNotice::HistoryFailed {
                    friend_id: request.friend_id.clone(),
                    message: e.to_string(),
                });
            }
        };

        for message in page.messages {
            if !conversation.contains(&message.id) {
                conversation
                    .messages
                    .push(ChatMessage::from_wire(message, &self.local_user_id));
            }
        }
        conversation.messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        conversation.cursor = page.next_cursor;
        conversation.has_more = page.has_more && conversation.cursor.is_some();
        Step::none()
    }

    /// Upsert REST conversation summaries. Existing message lists and unread
    /// counters are kept; a last message not seen yet is added as history.
    pub fn apply_summaries(&mut self, summaries: Vec<ConversationSummary>) {
        for summary in summaries {
            let friend_id = summary.friend_user_id;
            self.ensure_conversation(&friend_id, None, None);
            let Some(conversation) = self.conversations.get_mut(&friend_id) else {
                continue;
            };
            if summary.nickname.is_some() {
                conversation.nickname = summary.nickname;
            }
            if summary.avatar_url.is_some() {
                conversation.avatar_url = summary.avatar_url;
            }
            if let Some(last) = summary.last_message {
                if !conversation.contains(&last.id) {
                    conversation.insert_ordered(ChatMessage::from_wire(last, &self.local_user_id));
                }
            }
        }
    }

    pub fn apply(&mut self, event: ConversationEvent, now: Instant, timers: &mut TimerRegistry) -> ChatStep {
        match event {
            ConversationEvent::Message(message) => self.on_message(message, timers),
            ConversationEvent::ConversationUpdated(summary) => {
                let friend_id = summary.friend_user_id.clone();
                self.ensure_conversation(&friend_id, summary.nickname.clone(), summary.avatar_url.clone());
                if let Some(conversation) = self.conversations.get_mut(&friend_id) {
                    if summary.nickname.is_some() {
                        conversation.nickname = summary.nickname;
                    }
                    if summary.avatar_url.is_some() {
                        conversation.avatar_url = summary.avatar_url;
                    }
                }
                match summary.last_message {
                    Some(message) => self.on_message(message, timers),
                    None => Step::none(),
                }
            }
            ConversationEvent::UserTyping { user_id } => {
                if user_id == self.local_user_id {
                    return Step::none();
                }
                if let Some(conversation) = self.conversations.get_mut(&user_id) {
                    conversation.peer_typing = true;
                    timers.schedule_once(
                        TimerKey::new(TimerDomain::ChatTyping, user_id),
                        self.typing_expiry,
                        now,
                    );
                }
                Step::none()
            }
        }
    }

    fn on_message(&mut self, message: DirectMessage, timers: &mut TimerRegistry) -> ChatStep {
        let mine = message.sender_id == self.local_user_id;
        let friend_id = if mine {
            message.receiver_id.clone()
        } else {
            message.sender_id.clone()
        };
        self.ensure_conversation(&friend_id, None, None);
        let Some(conversation) = self.conversations.get_mut(&friend_id) else {
            return Step::none();
        };
        if conversation.contains(&message.id) {
            return Step::none();
        }

        let incoming = ChatMessage::from_wire(message, &self.local_user_id);
        if mine {
            let echo = conversation.messages.iter().position(|m| {
                m.delivery != DeliveryState::Delivered
                    && m.is_mine
                    && m.content == incoming.content
                    && m.image_path == incoming.image_path
            });
            // The confirmed copy takes the server's timestamp and position.
            if let Some(index) = echo {
                conversation.messages.remove(index);
            }
            conversation.insert_ordered(incoming);
            return Step::none();
        }

        conversation.unread = conversation.unread.saturating_add(1);
        if conversation.peer_typing {
            conversation.peer_typing = false;
            timers.cancel(&TimerKey::new(TimerDomain::ChatTyping, friend_id.clone()));
        }
        conversation.insert_ordered(incoming.clone());
        Step::notice(ChatNotice::Incoming {
            friend_id,
            message: incoming,
        })
    }

    /// Returns `true` if the view changed.
    pub fn on_timer(&mut self, key: &TimerKey) -> bool {
        if key.domain != TimerDomain::ChatTyping {
            return false;
        }
        match self.conversations.get_mut(&key.id) {
            Some(conversation) if conversation.peer_typing => {
                conversation.peer_typing = false;
                true
            }
            _ => false,
        }
    }

    /// Stop typing indicators and invalidate history requests in flight.
    pub fn reset(&mut self, timers: &mut TimerRegistry) {
        timers.clear_domain(TimerDomain::ChatTyping);
        for conversation in self.conversations.values_mut() {
            conversation.peer_typing = false;
            conversation.loading_more = false;
        }
        for generation in self.generations.values_mut() {
            *generation += 1;
        }
        self.typing_sent.clear();
    }
}
