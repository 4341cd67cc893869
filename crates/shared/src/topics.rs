//! Subscription topics and send destinations understood by the server.

use serde::{Deserialize, Serialize};

use crate::models::{ChatId, GroupId, UserId};

pub const PRESENCE_ANNOUNCE: &str = "/app/user.subscribe";
pub const PING: &str = "/app/ping";

pub fn notifications(user_id: UserId) -> String {
    format!("/user/{}/queue/notifications", user_id)
}

pub fn room_events(user_id: UserId) -> String {
    format!("/user/{}/queue/room-events", user_id)
}

pub fn ping_responses(user_id: UserId) -> String {
    format!("/user/{}/queue/ping", user_id)
}

pub fn direct_chat(chat_id: ChatId) -> String {
    format!("/user/{}/private", chat_id)
}

pub fn group(group_id: GroupId) -> String {
    format!("/group/{}", group_id)
}

pub fn direct_send(chat_id: ChatId) -> String {
    format!("/app/chat/{}", chat_id)
}

pub fn group_send(group_id: GroupId) -> String {
    format!("/app/group/{}/send", group_id)
}

pub fn group_react(group_id: GroupId) -> String {
    format!("/app/group/{}/react", group_id)
}

pub fn group_typing(group_id: GroupId) -> String {
    format!("/app/group/{}/typing", group_id)
}

/// Identifies one conversation: a direct chat or a group thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationKey {
    Direct(ChatId),
    Group(GroupId),
}

impl ConversationKey {
    /// Topic carrying this conversation's inbound frames.
    pub fn topic(&self) -> String {
        match self {
            ConversationKey::Direct(id) => direct_chat(*id),
            ConversationKey::Group(id) => group(*id),
        }
    }

    /// Destination accepting new messages for this conversation.
    pub fn send_destination(&self) -> String {
        match self {
            ConversationKey::Direct(id) => direct_send(*id),
            ConversationKey::Group(id) => group_send(*id),
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            ConversationKey::Group(id) => Some(*id),
            ConversationKey::Direct(_) => None,
        }
    }
}
