//! High-level chat client wiring the connection to the chat state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_shared::{ConversationKey, GroupFrame, GroupId, MessageId, MessageType};
use tokio::time::Instant;

use crate::auth::{CurrentUser, TokenProvider};
use crate::config::ChatConfig;
use crate::connection::{ConnectError, ConnectionManager, ConnectionState};
use crate::events::{ChatEvent, EventBus};
use crate::reactions::{ReactionError, ReactionState, ReactionTransition, ReactionView};
use crate::router::{InboundFrame, SubscriptionHandle};
use crate::sync::{MergeOutcome, Message, MessageSync, SendError, TempId};
use crate::transport::Transport;
use crate::typing::{Typist, TypingNotifier, TypingRoster};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Messages, reactions and typists for every open conversation.
#[derive(Debug)]
pub struct ChatState {
    pub sync: MessageSync,
    pub reactions: ReactionState,
    pub typing: TypingRoster,
}

/// Live subscription to one conversation topic.
#[must_use = "close the subscription when the conversation view goes away"]
#[derive(Debug)]
pub struct ConversationSubscription {
    key: ConversationKey,
    handle: SubscriptionHandle,
}

impl ConversationSubscription {
    pub fn key(&self) -> ConversationKey {
        self.key
    }

    /// Stop receiving frames for the conversation. Safe to call twice.
    pub fn close(&self) {
        self.handle.unsubscribe();
    }
}

/// One signed-in user's chat session.
pub struct ChatClient<T: Transport> {
    connection: ConnectionManager<T>,
    user: CurrentUser,
    state: Arc<Mutex<ChatState>>,
}

impl<T: Transport> ChatClient<T> {
    pub fn new(
        config: ChatConfig,
        transport: T,
        tokens: impl TokenProvider + 'static,
        user: CurrentUser,
    ) -> Self {
        let state = ChatState {
            sync: MessageSync::new(user.clone()),
            reactions: ReactionState::new(user.id),
            typing: TypingRoster::new(config.typing_idle_timeout),
        };
        Self {
            connection: ConnectionManager::new(config, transport, tokens),
            user,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn events(&self) -> &EventBus {
        self.connection.events()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect(&self.user).await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Subscribe to a conversation and merge everything it delivers.
    ///
    /// Returns `None` when not connected.
    pub fn open_conversation(&self, key: ConversationKey) -> Option<ConversationSubscription> {
        let state = Arc::clone(&self.state);
        let events = self.connection.events().clone();
        let me = self.user.id;

        let handle = self
            .connection
            .subscribe_to_topic(&key.topic(), move |frame: &InboundFrame| {
                let parsed: GroupFrame = match serde_json::from_value(frame.body.clone()) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!("Unrecognized frame on {}: {}", frame.topic, e);
                        return;
                    }
                };

                match parsed {
                    GroupFrame::Message(message) => {
                        let outcome = lock(&state).sync.receive(key, message.clone());
                        if matches!(
                            outcome,
                            MergeOutcome::Confirmed { .. } | MergeOutcome::Inserted { .. }
                        ) {
                            events.emit(ChatEvent::GroupMessageReceived {
                                conversation: key,
                                message,
                            });
                        }
                    }
                    GroupFrame::Reactions(snapshot) => {
                        let mut guard = lock(&state);
                        let ChatState { sync, reactions, .. } = &mut *guard;
                        match sync.message_mut(key, snapshot.message_id) {
                            Some(message) => {
                                reactions.apply_snapshot(message, snapshot);
                            }
                            None => tracing::debug!(
                                "Reaction snapshot for unknown message {}",
                                snapshot.message_id
                            ),
                        }
                    }
                    GroupFrame::Typing(event) => {
                        if event.user_id != me {
                            lock(&state).typing.apply(&event, Instant::now());
                        }
                    }
                }
            })?;

        Some(ConversationSubscription { key, handle })
    }

    /// Close a conversation and forget its state.
    pub fn close_conversation(&self, subscription: ConversationSubscription) {
        subscription.close();
        let key = subscription.key;
        let mut state = lock(&self.state);
        if let Some(conversation) = state.sync.evict(key) {
            for id in conversation.messages().iter().filter_map(|m| m.id) {
                state.reactions.forget(id);
            }
        }
        if let Some(group_id) = key.group_id() {
            state.typing.forget_group(group_id);
        }
    }

    pub fn send_message(
        &self,
        key: ConversationKey,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Result<TempId, SendError> {
        lock(&self.state)
            .sync
            .send_message(&self.connection, key, content, message_type)
    }

    pub fn toggle_reaction(
        &self,
        group_id: GroupId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<ReactionTransition, ReactionError> {
        let mut guard = lock(&self.state);
        let ChatState { sync, reactions, .. } = &mut *guard;
        let message = sync
            .message(ConversationKey::Group(group_id), message_id)
            .ok_or(ReactionError::UnknownMessage(message_id))?;
        reactions.toggle_reaction(&self.connection, group_id, message, emoji)
    }

    pub fn remove_all_reactions(
        &self,
        group_id: GroupId,
        message_id: MessageId,
    ) -> Result<(), ReactionError> {
        let mut state = lock(&self.state);
        if state
            .sync
            .message(ConversationKey::Group(group_id), message_id)
            .is_none()
        {
            return Err(ReactionError::UnknownMessage(message_id));
        }
        state.reactions.remove_all(&self.connection, group_id, message_id)
    }

    pub fn typing_notifier(&self, group_id: GroupId) -> TypingNotifier<ConnectionManager<T>> {
        TypingNotifier::new(
            self.connection.clone(),
            group_id,
            self.connection.config().typing_idle_timeout,
        )
    }

    /// Snapshot of a conversation's messages in display order.
    pub fn messages(&self, key: ConversationKey) -> Vec<Message> {
        lock(&self.state).sync.messages(key).to_vec()
    }

    /// Sends still waiting for their echo.
    pub fn pending_messages(&self, key: ConversationKey) -> Vec<Message> {
        lock(&self.state)
            .sync
            .resync_pending(key)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn reaction_view(&self, key: ConversationKey, message_id: MessageId) -> Option<ReactionView> {
        let state = lock(&self.state);
        let message = state.sync.message(key, message_id)?;
        Some(state.reactions.view(message))
    }

    pub fn typing_in(&self, group_id: GroupId) -> Vec<Typist> {
        lock(&self.state).typing.typing_in(group_id, Instant::now())
    }

    /// Direct access for callers that fill history from REST.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        f(&mut lock(&self.state))
    }
}
