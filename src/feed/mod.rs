// Streaming market data module
pub mod backoff;
pub mod cache;
pub mod connection;
pub mod stream;

pub use backoff::{Backoff, BackoffConfig};
pub use cache::{snapshot_channel, SnapshotPublisher, SnapshotReader};
pub use connection::{
    ConnectionState, ConnectionStatus, FeedConfig, MarketDataConnection, ReconnectMachine,
};
pub use stream::{MarketStream, WebSocketStream};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("reconnect attempts exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}
