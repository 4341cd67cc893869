//! JSON payloads carried in STOMP frame bodies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ChatId = i64;
pub type GroupId = i64;
pub type MessageId = i64;

// --- Messaging ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
}

/// Author of a message as embedded by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// One user's reaction on a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionEntry {
    pub user_id: UserId,
    #[serde(alias = "reaction")]
    pub emoji: String,
}

/// A message as delivered on a conversation topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Absent until the server has stored the message.
    #[serde(default)]
    pub id: Option<MessageId>,
    pub content: String,
    pub sender: SenderInfo,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub reactions: Vec<ReactionEntry>,
    #[serde(default)]
    pub reaction_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub total_reaction_count: u32,
    /// Correlation token echoed back from the sending client, when the
    /// server passes it through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
}

/// Body of a message send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

// --- Reactions ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    React,
    RemoveReaction,
    RemoveAllReactions,
}

/// Body of a reaction change sent to `/app/group/{id}/react`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    pub group_id: GroupId,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<String>,
    pub action: ReactionAction,
}

/// Authoritative reaction state for one message, broadcast by the server
/// after any reaction change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSnapshot {
    pub message_id: MessageId,
    #[serde(default)]
    pub reactions: Vec<ReactionEntry>,
    pub reaction_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub total_reaction_count: u32,
}

// --- Typing ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TypingAction {
    Typing,
    StopTyping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub group_id: GroupId,
    pub action: TypingAction,
}

/// Typing notice relayed by the server to the rest of the group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub group_id: GroupId,
    pub user_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    pub action: TypingAction,
}

/// Anything that can arrive on a `/group/{id}` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GroupFrame {
    Typing(TypingEvent),
    Reactions(ReactionSnapshot),
    Message(ChatMessage),
}

// --- Presence ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceAnnounce {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub user_id: UserId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}
