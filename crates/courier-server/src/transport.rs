//! Socket seam between the delivery engine and the actual WebSocket.
//!
//! The engine only ever writes text payloads and closes; putting that
//! behind a trait keeps every registry and acknowledgment path testable
//! without a network socket.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one text message. Writes are serialized per transport.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
    /// Close the underlying socket. Safe to call more than once.
    async fn close(&self);
}

/// Production transport over the write half of an axum WebSocket.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}
