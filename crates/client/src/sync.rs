//! Optimistic message sending and reconciliation with server echoes.
//!
//! Every conversation is kept in ascending `(created_at, id)` order, with
//! unconfirmed placeholders after confirmed messages sharing a timestamp.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parley_shared::{
    ChatMessage, ConversationKey, MessageId, MessageType, OutgoingMessage, ReactionEntry,
    SenderInfo,
};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::connection::FrameSink;

/// Client-generated id of an optimistic message, also sent as `clientId`.
pub type TempId = String;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("not connected; the message was not sent")]
    NotConnected,
}

/// A message as displayed in a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub temp_id: Option<TempId>,
    pub content: String,
    pub sender: SenderInfo,
    pub created_at: DateTime<Utc>,
    pub message_type: MessageType,
    pub reactions: Vec<ReactionEntry>,
    pub reaction_counts: BTreeMap<String, u32>,
    pub total_reaction_count: u32,
    pub is_optimistic: bool,
}

impl Message {
    fn optimistic(sender: SenderInfo, content: String, message_type: MessageType, temp_id: TempId) -> Self {
        Self {
            id: None,
            temp_id: Some(temp_id),
            content,
            sender,
            created_at: Utc::now(),
            message_type,
            reactions: Vec::new(),
            reaction_counts: BTreeMap::new(),
            total_reaction_count: 0,
            is_optimistic: true,
        }
    }

    fn confirmed(msg: ChatMessage, temp_id: Option<TempId>) -> Self {
        Self {
            id: msg.id,
            temp_id,
            content: msg.content,
            sender: msg.sender,
            created_at: msg.created_at,
            message_type: msg.message_type,
            reactions: msg.reactions,
            reaction_counts: msg.reaction_counts,
            total_reaction_count: msg.total_reaction_count,
            is_optimistic: false,
        }
    }

    /// Sort key: timestamp, then confirmed before unconfirmed, then id.
    fn order_key(&self) -> (DateTime<Utc>, bool, MessageId) {
        (self.created_at, self.id.is_none(), self.id.unwrap_or_default())
    }

    fn is_pending(&self) -> bool {
        self.is_optimistic && self.id.is_none()
    }
}

/// What [`MessageSync::receive`] did with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Replaced the placeholder created by our own send.
    Confirmed { temp_id: TempId, index: usize },
    /// Added as a new message.
    Inserted { index: usize },
    /// A message with this id is already shown.
    Duplicate,
    /// The server has not assigned an id; nothing to merge.
    MissingId,
}

/// Ordered messages of one conversation.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    is_loaded: bool,
}

impl Conversation {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Whether history has been filled from the REST API.
    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn find(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == Some(id))
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == Some(id))
    }

    fn contains_id(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.id == Some(id))
    }

    /// Insert keeping sort order. Equal keys keep arrival order.
    fn insert_sorted(&mut self, msg: Message) -> usize {
        let key = msg.order_key();
        let pos = self.messages.partition_point(|m| m.order_key() <= key);
        self.messages.insert(pos, msg);
        pos
    }

    /// Swap a placeholder for its confirmation at the same position, unless
    /// the server timestamp would break ordering there.
    fn replace_at(&mut self, index: usize, confirmed: Message) -> usize {
        let key = confirmed.order_key();
        let after_prev = index == 0 || self.messages[index - 1].order_key() <= key;
        let before_next = self
            .messages
            .get(index + 1)
            .map_or(true, |next| key <= next.order_key());
        if after_prev && before_next {
            self.messages[index] = confirmed;
            index
        } else {
            tracing::debug!("Confirmed message moved to keep ordering");
            self.messages.remove(index);
            self.insert_sorted(confirmed)
        }
    }

    fn remove_temp(&mut self, temp_id: &str) -> Option<Message> {
        let pos = self
            .messages
            .iter()
            .position(|m| m.is_pending() && m.temp_id.as_deref() == Some(temp_id))?;
        Some(self.messages.remove(pos))
    }

    /// Placeholder an echo of ours confirms.
    ///
    /// An echo carrying a `clientId` only matches the placeholder with that
    /// temp id. Without one, the first pending message with the same sender
    /// and content is taken, which is ambiguous for identical rapid sends.
    fn match_placeholder(&self, echo: &ChatMessage) -> Option<usize> {
        if let Some(client_id) = echo.client_id.as_deref() {
            return self
                .messages
                .iter()
                .position(|m| m.is_pending() && m.temp_id.as_deref() == Some(client_id));
        }
        self.messages
            .iter()
            .position(|m| m.is_pending() && m.sender.id == echo.sender.id && m.content == echo.content)
    }
}

/// Reconciles locally authored messages with the server's copies.
#[derive(Debug)]
pub struct MessageSync {
    user: CurrentUser,
    conversations: HashMap<ConversationKey, Conversation>,
}

impl MessageSync {
    pub fn new(user: CurrentUser) -> Self {
        Self {
            user,
            conversations: HashMap::new(),
        }
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    /// Show the message immediately, then hand it to `sink`.
    ///
    /// If the sink refuses the frame the placeholder is removed again and
    /// nothing is retried.
    pub fn send_message<S: FrameSink>(
        &mut self,
        sink: &S,
        key: ConversationKey,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Result<TempId, SendError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(SendError::EmptyContent);
        }

        let temp_id = Uuid::new_v4().to_string();
        let placeholder = Message::optimistic(
            self.user.as_sender(),
            content.clone(),
            message_type,
            temp_id.clone(),
        );
        let conversation = self.conversations.entry(key).or_default();
        conversation.insert_sorted(placeholder);

        let (group_id, chat_id) = match key {
            ConversationKey::Group(id) => (Some(id), None),
            ConversationKey::Direct(id) => (None, Some(id)),
        };
        let payload = OutgoingMessage {
            content,
            message_type,
            group_id,
            chat_id,
            client_id: Some(temp_id.clone()),
        };

        if sink.send_json(&key.send_destination(), &payload) {
            Ok(temp_id)
        } else {
            conversation.remove_temp(&temp_id);
            tracing::warn!("Send to {:?} failed, rolled back {}", key, temp_id);
            Err(SendError::NotConnected)
        }
    }

    /// Merge a message delivered on the conversation topic.
    pub fn receive(&mut self, key: ConversationKey, msg: ChatMessage) -> MergeOutcome {
        let Some(id) = msg.id else {
            tracing::debug!("Ignoring message without id on {:?}", key);
            return MergeOutcome::MissingId;
        };
        let conversation = self.conversations.entry(key).or_default();
        if conversation.contains_id(id) {
            return MergeOutcome::Duplicate;
        }

        if msg.sender.id == self.user.id {
            if let Some(index) = conversation.match_placeholder(&msg) {
                let temp_id = conversation.messages[index].temp_id.clone().unwrap_or_default();
                let index = conversation.replace_at(index, Message::confirmed(msg, Some(temp_id.clone())));
                return MergeOutcome::Confirmed { temp_id, index };
            }
            tracing::debug!("No placeholder for own message {} on {:?}", id, key);
        }

        let index = conversation.insert_sorted(Message::confirmed(msg, None));
        MergeOutcome::Inserted { index }
    }

    /// Replace a conversation's confirmed messages with fetched history.
    ///
    /// Placeholders still waiting for their echo are kept.
    pub fn load_history(&mut self, key: ConversationKey, mut history: Vec<ChatMessage>) {
        history.retain(|m| m.id.is_some());
        history.sort_by_key(|m| (m.created_at, m.id));
        history.dedup_by_key(|m| m.id);

        let conversation = self.conversations.entry(key).or_default();
        let pending: Vec<Message> = conversation
            .messages
            .drain(..)
            .filter(|m| {
                m.is_pending()
                    && !history
                        .iter()
                        .any(|h| h.client_id.is_some() && h.client_id == m.temp_id)
            })
            .collect();

        conversation.messages = history
            .into_iter()
            .map(|m| Message::confirmed(m, None))
            .collect();
        for msg in pending {
            conversation.insert_sorted(msg);
        }
        conversation.is_loaded = true;
    }

    pub fn conversation(&self, key: ConversationKey) -> Option<&Conversation> {
        self.conversations.get(&key)
    }

    pub fn messages(&self, key: ConversationKey) -> &[Message] {
        self.conversations
            .get(&key)
            .map(Conversation::messages)
            .unwrap_or_default()
    }

    pub fn message(&self, key: ConversationKey, id: MessageId) -> Option<&Message> {
        self.conversations.get(&key)?.find(id)
    }

    pub fn message_mut(&mut self, key: ConversationKey, id: MessageId) -> Option<&mut Message> {
        self.conversations.get_mut(&key)?.find_mut(id)
    }

    /// Drop a conversation's state when it is closed.
    pub fn evict(&mut self, key: ConversationKey) -> Option<Conversation> {
        self.conversations.remove(&key)
    }

    /// Placeholders whose echo never arrived, e.g. to resend after a
    /// reconnect.
    pub fn resync_pending(&self, key: ConversationKey) -> Vec<&Message> {
        self.conversations
            .get(&key)
            .map(|c| c.messages.iter().filter(|m| m.is_pending()).collect())
            .unwrap_or_default()
    }
}
