//! Parley client - real-time chat synchronization core
//!
//! Keeps one STOMP session per signed-in user, multiplexes conversation
//! topics over it, and reconciles optimistic local state (sent messages,
//! reactions) with what the server confirms.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod reactions;
pub mod router;
pub mod sync;
pub mod transport;
pub mod typing;

pub use auth::{CurrentUser, SharedToken, TokenProvider};
pub use client::{ChatClient, ChatState, ConversationSubscription};
pub use config::{ChatConfig, ConfigError};
pub use connection::{ConnectError, ConnectionManager, ConnectionState, FrameSink, ReconnectConfig};
pub use events::{ChatEvent, EventBus};
pub use reactions::{PendingReaction, ReactionError, ReactionState, ReactionTransition, ReactionView};
pub use router::{InboundFrame, SubscriptionHandle};
pub use sync::{Conversation, MergeOutcome, Message, MessageSync, SendError, TempId};
pub use transport::{Transport, TransportError, WebSocketTransport, WireChannel};
pub use typing::{Typist, TypingNotifier, TypingRoster};
