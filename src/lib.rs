// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod execution;
pub mod feed;
pub mod levels;
pub mod models;
pub mod persistence;
pub mod regime;
pub mod risk;

// Re-export commonly used types
pub use crate::config::EngineConfig;
pub use crate::engine::{CycleReport, CycleScheduler, TradingEngine};
pub use error::EngineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
