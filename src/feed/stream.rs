use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use super::FeedError;
use crate::models::Tick;

type WsConnection =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Transport underneath the market data connection
///
/// Implementations only move bytes; reconnect policy lives in
/// `MarketDataConnection`.
#[async_trait]
pub trait MarketStream: Send {
    async fn connect(&mut self) -> Result<(), FeedError>;

    /// Issue subscriptions on the current connection
    async fn subscribe(&mut self, pairs: &[String]) -> Result<(), FeedError>;

    /// Next price update. `Ok(None)` means the server closed the stream.
    async fn next_tick(&mut self) -> Result<Option<Tick>, FeedError>;

    async fn close(&mut self);
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    op: &'static str,
    pairs: &'a [String],
}

/// Generic tick message: `{"pair": "...", "price": 1.0, "volume": 2.0, "ts": 1700000000000}`
#[derive(Debug, Deserialize)]
struct WireTick {
    pair: String,
    price: f64,
    #[serde(default)]
    volume: f64,
    /// Milliseconds since epoch
    #[serde(default)]
    ts: Option<i64>,
}

impl WireTick {
    fn into_tick(self) -> Tick {
        let timestamp: DateTime<Utc> = self
            .ts
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Tick {
            pair: self.pair,
            price: self.price,
            volume: self.volume,
            timestamp,
        }
    }
}

/// JSON-over-WebSocket price stream
pub struct WebSocketStream {
    url: String,
    socket: Option<WsConnection>,
}

impl WebSocketStream {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: None,
        }
    }

    fn socket(&mut self) -> Result<&mut WsConnection, FeedError> {
        self.socket
            .as_mut()
            .ok_or_else(|| FeedError::Transport("not connected".to_string()))
    }
}

#[async_trait]
impl MarketStream for WebSocketStream {
    async fn connect(&mut self) -> Result<(), FeedError> {
        self.close().await;

        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(format!("{}: {}", self.url, e)))?;

        tracing::info!(url = %self.url, "WebSocket connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn subscribe(&mut self, pairs: &[String]) -> Result<(), FeedError> {
        let payload = serde_json::to_string(&SubscribeRequest {
            op: "subscribe",
            pairs,
        })
        .map_err(|e| FeedError::Decode(e.to_string()))?;

        self.socket()?
            .send(Message::Text(payload))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        tracing::debug!(count = pairs.len(), "Subscriptions sent");
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<Option<Tick>, FeedError> {
        let socket = self.socket()?;

        while let Some(message) = socket.next().await {
            let message = message.map_err(|e| FeedError::Transport(e.to_string()))?;

            match message {
                Message::Text(text) => match serde_json::from_str::<WireTick>(&text) {
                    Ok(wire) => return Ok(Some(wire.into_tick())),
                    Err(e) => {
                        // Acks, heartbeats and other chatter
                        tracing::debug!("Ignoring non-tick message ({}): {}", e, text);
                    }
                },
                Message::Ping(data) => {
                    socket
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| FeedError::Transport(e.to_string()))?;
                }
                Message::Close(frame) => {
                    tracing::warn!(?frame, "Server closed market stream");
                    return Ok(None);
                }
                _ => {}
            }
        }

        Ok(None)
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}
