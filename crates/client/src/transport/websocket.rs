//! WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_channel::mpsc::unbounded;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Transport, TransportError, WireChannel};

/// Opens plain or TLS WebSocket connections.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<WireChannel, TransportError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        tracing::info!("WebSocket connected to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = unbounded::<String>();
        let (in_tx, in_rx) = unbounded::<String>();

        // Read task
        let url_for_read = url.to_string();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if in_tx.unbounded_send(text.to_string()).is_err() {
                            // Session dropped its receiver
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket to {} received close frame", url_for_read);
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        // Pong is handled automatically by tungstenite
                        tracing::debug!("Received ping: {:?}", data);
                    }
                    Ok(_) => {
                        // Ignore binary, pong, etc.
                    }
                    Err(e) => {
                        tracing::error!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            // in_tx drops here, ending the session's inbound stream
        });

        // Write task
        let url_for_write = url.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.next().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    tracing::error!("Send to {} failed: {}", url_for_write, e);
                    break;
                }
            }
            tracing::debug!("Outgoing channel to {} closed, closing socket", url_for_write);
            let _ = write.close().await;
        });

        Ok(WireChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
