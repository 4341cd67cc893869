//! Shared wire contract for the parley chat client.
//!
//! The server speaks STOMP 1.2 over a WebSocket. This crate holds the frame
//! codec, the topic and destination names, and the JSON payloads carried in
//! frame bodies.

pub mod error;
pub mod models;
pub mod stomp;
pub mod topics;

pub use error::*;
pub use models::*;
pub use stomp::{Command, Frame};
pub use topics::ConversationKey;
