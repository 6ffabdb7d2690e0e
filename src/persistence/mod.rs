// Engine state persistence module
pub mod file;
pub mod redis_store;

pub use file::FileSnapshotStore;
pub use redis_store::RedisSnapshotStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

use crate::execution::{LedgerSnapshot, Position};
use crate::levels::PerformanceWindow;
use crate::risk::SafetyState;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Stored state exists but cannot be trusted
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}

/// Everything needed to resume after a restart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub ledger: LedgerSnapshot,
    pub tier_index: usize,
    pub tier_name: String,
    pub open_positions: Vec<Position>,
    pub performance: PerformanceWindow,
    pub safety: SafetyState,
}

impl EngineSnapshot {
    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::Serialize(e.to_string()))
    }

    /// Decode and sanity-check a stored snapshot
    pub fn from_json(text: &str) -> Result<Self, PersistenceError> {
        let snapshot: EngineSnapshot =
            serde_json::from_str(text).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        snapshot.check()?;
        Ok(snapshot)
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::Corrupt(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }

        // A gap loss can leave available below zero; it still has to be a number
        let non_negative = [self.ledger.committed, self.ledger.max_exposure_fraction];
        if !self.ledger.available.is_finite()
            || non_negative.iter().any(|n| !n.is_finite() || *n < 0.0)
        {
            return Err(PersistenceError::Corrupt(format!(
                "ledger out of range: {:?}",
                self.ledger
            )));
        }

        let committed: f64 = self.open_positions.iter().map(|p| p.size).sum();
        if (committed - self.ledger.committed).abs() > 1e-6 {
            return Err(PersistenceError::Corrupt(format!(
                "positions hold ${:.2} but ledger has ${:.2} committed",
                committed, self.ledger.committed
            )));
        }

        Ok(())
    }
}

/// Durable home of the engine snapshot
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<(), PersistenceError>;

    /// `None` on first start
    async fn load(&self) -> Result<Option<EngineSnapshot>, PersistenceError>;
}

/// In-process store for tests and dry runs
#[derive(Default)]
pub struct MemorySnapshotStore {
    saved: Mutex<Option<String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored text as-is
    pub fn put_raw(&self, text: impl Into<String>) {
        if let Ok(mut saved) = self.saved.lock() {
            *saved = Some(text.into());
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<(), PersistenceError> {
        let text = snapshot.to_json()?;
        let mut saved = self
            .saved
            .lock()
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        *saved = Some(text);
        Ok(())
    }

    async fn load(&self) -> Result<Option<EngineSnapshot>, PersistenceError> {
        let saved = self
            .saved
            .lock()
            .map_err(|e| PersistenceError::Backend(e.to_string()))?
            .clone();

        saved.as_deref().map(EngineSnapshot::from_json).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StoreBackend,
    pub path: String,
    pub redis_url: String,
    pub redis_key: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: "data/engine_snapshot.json".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_key: "tierbot:snapshot".to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::execution::{PositionStatus, TrailingStop};
    use crate::models::Direction;
    use uuid::Uuid;

    pub fn position(pair: &str, size: f64) -> Position {
        Position {
            id: Uuid::new_v4(),
            pair: pair.to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            size,
            quantity: size / 100.0,
            fees: 0.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            trailing: TrailingStop {
                armed: false,
                peak_price: 100.0,
                distance_pct: 0.01,
            },
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            close_reason: None,
            realized_pnl: None,
            exit_price: None,
            closed_at: None,
            tier: "Balanced".to_string(),
        }
    }

    pub fn snapshot() -> EngineSnapshot {
        let now = Utc::now();
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            ledger: LedgerSnapshot {
                available: 900.0,
                committed: 100.0,
                max_exposure_fraction: 0.8,
            },
            tier_index: 2,
            tier_name: "Balanced".to_string(),
            open_positions: vec![position("BTC/USD", 60.0), position("ETH/USD", 40.0)],
            performance: PerformanceWindow::new(20, 1_000.0, now),
            safety: SafetyState::new(1_000.0, now),
        }
    }
}
