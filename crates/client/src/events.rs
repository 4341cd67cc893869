//! Typed event bus for listeners outside the sync core.
//!
//! Anything that used to be a loosely named UI event is a [`ChatEvent`]
//! variant. Listeners call [`EventBus::subscribe`] and drop the receiver when
//! they go away.

use parley_shared::{ChatMessage, ConversationKey};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::connection::ConnectionState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Payload from the personal notification queue.
    NotificationReceived(Value),
    /// Payload from the personal room-event queue.
    RoomEventReceived(Value),
    /// A confirmed or remote message was merged into a conversation.
    GroupMessageReceived {
        conversation: ConversationKey,
        message: ChatMessage,
    },
    /// Reply on the personal ping queue.
    PingResponse(Value),
    ConnectionStateChanged(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no listeners is not an error.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.sender.send(event);
    }
}
