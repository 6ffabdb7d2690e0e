use thiserror::Error;

use crate::api::ExchangeError;
use crate::feed::FeedError;
use crate::persistence::PersistenceError;

/// Engine-level error taxonomy
///
/// Every component error folds into one of these buckets so the scheduler
/// can decide between "skip this cycle" and "halt".
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient network trouble, retried by the reconnect machine
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Missing, stale or invalid market data. Never traded on.
    #[error("data: {0}")]
    Data(String),

    /// Exchange refused an order. Not retried automatically.
    #[error("exchange rejected order: {0}")]
    ExchangeRejection(String),

    /// A circuit breaker fired
    #[error("safety violation: {0}")]
    SafetyViolation(String),

    /// Requires operator intervention
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

impl From<FeedError> for EngineError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::RetriesExhausted { .. } => EngineError::Fatal(err.to_string()),
            FeedError::Decode(_) => EngineError::Data(err.to_string()),
            _ => EngineError::Connectivity(err.to_string()),
        }
    }
}

impl From<ExchangeError> for EngineError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Rejected(_) | ExchangeError::InsufficientFunds(_) => {
                EngineError::ExchangeRejection(err.to_string())
            }
            ExchangeError::InvalidResponse(_) | ExchangeError::UnknownPair(_) => {
                EngineError::Data(err.to_string())
            }
            ExchangeError::Timeout(_) | ExchangeError::Network(_) => {
                EngineError::Connectivity(err.to_string())
            }
        }
    }
}

impl From<PersistenceError> for EngineError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Corrupt(_) => EngineError::Fatal(err.to_string()),
            _ => EngineError::Persistence(err.to_string()),
        }
    }
}

impl From<::config::ConfigError> for EngineError {
    fn from(err: ::config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
