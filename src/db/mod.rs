// Trade journal module
pub mod postgres;

pub use postgres::PostgresJournal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::execution::Position;
use crate::persistence::PersistenceError;

/// Append-only archive of closed positions
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn record_close(&self, position: &Position) -> Result<(), PersistenceError>;

    /// Most recent closes, newest first
    async fn recent_closes(&self, limit: i64) -> Result<Vec<Position>, PersistenceError>;

    async fn total_realized_pnl(&self) -> Result<f64, PersistenceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct JournalConfig {
    /// Postgres URL; no journal when unset
    pub database_url: Option<String>,
}
