//! Byte-level transport underneath the STOMP session.
//!
//! A [`Transport`] opens one full-duplex text channel. The connection manager
//! owns the STOMP framing on top of it; transports only move strings.

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use thiserror::Error;

mod websocket;

pub use websocket::WebSocketTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("transport closed")]
    Closed,
}

/// One open text channel.
///
/// Dropping `outgoing` closes the underlying socket. `incoming` ends when the
/// peer goes away.
pub struct WireChannel {
    pub outgoing: UnboundedSender<String>,
    pub incoming: UnboundedReceiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<WireChannel, TransportError>;
}
