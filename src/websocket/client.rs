//! WebSocket client for the position stream
//!
//! Owns at most one socket. Reconnection policy lives in the manager.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::parser::Request;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketClient {
    stream: Option<WsStream>,
    endpoint: String,
}

impl WebSocketClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open a fresh socket, closing any previous one first
    pub async fn connect(&mut self, connect_timeout: Duration) -> Result<()> {
        self.close().await;
        info!(url = %self.endpoint, "Connecting to position stream");

        let (ws_stream, response) = timeout(connect_timeout, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| FeedError::ConnectionTimeout)?
            .map_err(|e| FeedError::WebSocketConnection(format!("Failed to connect: {}", e)))?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);
        Ok(())
    }

    /// Serialize and write one request frame
    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let text = serde_json::to_string(request)
            .map_err(|e| FeedError::SerializationError(e.to_string()))?;
        debug!(frame = %text, "Sending request");

        let result = self.stream_mut()?.send(Message::Text(text)).await;
        result.map_err(|e| self.drop_stream(FeedError::WebSocketMessage(e.to_string())))
    }

    /// Next application payload
    ///
    /// `Ok(None)` means a control frame arrived; tungstenite queues the pong
    /// reply to server pings on its own. Any error leaves the client
    /// disconnected.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let next = self.stream_mut()?.next().await;

        match next {
            Some(Ok(Message::Text(text))) => Ok(Some(text)),
            Some(Ok(Message::Binary(data))) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("Closed by server: {} {}", f.code, f.reason))
                    .unwrap_or_else(|| "Closed by server".to_string());
                Err(self.drop_stream(FeedError::WebSocketConnection(reason)))
            }
            Some(Ok(other)) => {
                debug!(frame = ?other, "Control frame");
                Ok(None)
            }
            Some(Err(e)) => Err(self.drop_stream(FeedError::WebSocketMessage(e.to_string()))),
            None => Err(self.drop_stream(FeedError::WebSocketConnection(
                "Stream ended".to_string(),
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Send a close frame if a socket is open
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| FeedError::WebSocketConnection("Not connected".to_string()))
    }

    fn drop_stream(&mut self, error: FeedError) -> FeedError {
        warn!(error = %error, "Position stream socket lost");
        self.stream = None;
        error
    }
}
