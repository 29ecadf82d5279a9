//! Transport seam for the connection manager
//!
//! A transport opens one bidirectional text channel per session. The manager
//! only sees the two halves of a [`TransportLink`]; the websocket plumbing
//! lives in the pump tasks spawned here.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::SessionKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("transport closed")]
    Closed,
}

/// Text frames out and in. Dropping `outbound` closes the link.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, key: &SessionKey) -> Result<TransportLink, TransportError>;
}

/// Websocket transport at `{base}/api/ws/{sessionId}`
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    base_url: String,
}

impl WebSocketTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, key: &SessionKey) -> String {
        format!("{}/api/ws/{}", self.base_url, key.session_id)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, key: &SessionKey) -> Result<TransportLink, TransportError> {
        let url = self.url_for(key);
        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(%url, "Websocket open");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        // outbound channel -> socket
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // socket -> inbound channel
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(%url, error = %e, "Websocket read failed");
                        break;
                    }
                };
                if inbound_tx.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_uses_session_id_only() {
        let transport = WebSocketTransport::new("ws://localhost:3000/");
        let key = SessionKey::new("abc").with_model("claude");
        assert_eq!(transport.url_for(&key), "ws://localhost:3000/api/ws/abc");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_connect_error() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1");
        let err = transport.open(&SessionKey::new("s")).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
