//! Persistent STOMP session with state tracking and automatic recovery.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::transport::TransportError;

mod manager;

pub use manager::ConnectionManager;

/// Connection state for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Configuration for automatic reconnection.
///
/// The delay between attempts is fixed; there is no backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Attempts made before giving up until the next explicit connect.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no auth token available")]
    MissingCredential,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server rejected the connection: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for CONNECTED")]
    Timeout,
    #[error("connection attempt was cancelled by disconnect")]
    Cancelled,
    #[error("the in-flight connection attempt failed")]
    AttemptFailed,
}

/// Outbound half of the connection as seen by the sync engines.
///
/// `send_frame` reports failure with `false`; it never panics. Callers own
/// compensation for a failed send.
pub trait FrameSink {
    fn send_frame(&self, destination: &str, payload: &Value) -> bool;

    fn send_json<P: Serialize>(&self, destination: &str, payload: &P) -> bool
    where
        Self: Sized,
    {
        match serde_json::to_value(payload) {
            Ok(value) => self.send_frame(destination, &value),
            Err(e) => {
                tracing::error!("Failed to serialize payload for {}: {}", destination, e);
                false
            }
        }
    }
}
