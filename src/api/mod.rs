// Exchange adapter module
pub mod paper;
pub mod rest;

pub use paper::PaperExchange;
pub use rest::RestExchangeClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::OrderSide;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unknown pair: {0}")]
    UnknownPair(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Executed market order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub fee: f64,
}

/// Everything the engine needs from an exchange
///
/// All calls are fallible; the engine wraps each one in a timeout.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn fetch_price(&self, pair: &str) -> Result<PriceQuote, ExchangeError>;

    /// Market order for `quantity` base units
    async fn place_market_order(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<Fill, ExchangeError>;

    /// Currency -> amount
    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, ExchangeError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    /// Environment variable holding the API key, if the venue needs one
    pub api_key_env: Option<String>,
    /// Bound on every exchange call made by the engine
    pub timeout_ms: u64,
    pub requests_per_minute: u32,
    pub paper_fee_pct: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key_env: None,
            timeout_ms: 10_000,
            requests_per_minute: 60,
            paper_fee_pct: 0.001,
        }
    }
}
