use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Side of an open position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// What the decision oracle wants to do with a pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalDirection {
    Long,
    Short,
    Hold,
}

impl SignalDirection {
    pub fn as_direction(&self) -> Option<Direction> {
        match self {
            SignalDirection::Long => Some(Direction::Long),
            SignalDirection::Short => Some(Direction::Short),
            SignalDirection::Hold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalSource {
    Oracle,
    RuleBased,
}

/// Trading signal for one pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeSignal {
    pub pair: String,
    pub direction: SignalDirection,
    pub confidence: f64,          // 0.0 - 1.0
    pub expected_profit_pct: f64, // fraction, 0.08 = 8%
    pub reasoning: String,
    pub source: SignalSource,
}

/// Single streaming update for a pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub pair: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Latest known price/volume for a pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PairQuote {
    pub price: f64,
    pub volume: f64,
    pub updated_at: DateTime<Utc>,
}

impl PairQuote {
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds()
    }
}

/// Immutable view of the market, replaced wholesale on every update
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub sequence: u64,
    pub published_at: Option<DateTime<Utc>>,
    pub quotes: HashMap<String, PairQuote>,
}

impl MarketSnapshot {
    pub fn quote(&self, pair: &str) -> Option<&PairQuote> {
        self.quotes.get(pair)
    }

    /// Price for a pair, only if it is usable
    pub fn price(&self, pair: &str) -> Option<f64> {
        self.quotes
            .get(pair)
            .filter(|q| q.is_valid())
            .map(|q| q.price)
    }

    /// Copy of this snapshot with one tick applied
    pub fn with_tick(&self, tick: &Tick) -> Self {
        let mut quotes = self.quotes.clone();
        quotes.insert(
            tick.pair.clone(),
            PairQuote {
                price: tick.price,
                volume: tick.volume,
                updated_at: tick.timestamp,
            },
        );

        Self {
            sequence: self.sequence + 1,
            published_at: Some(tick.timestamp),
            quotes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(pair: &str, price: f64) -> Tick {
        Tick {
            pair: pair.to_string(),
            price,
            volume: 1000.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Long.entry_side(), OrderSide::Buy);
        assert_eq!(Direction::Long.exit_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.entry_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.exit_side(), OrderSide::Buy);
    }

    #[test]
    fn test_snapshot_with_tick_is_a_new_value() {
        let empty = MarketSnapshot::default();
        let first = empty.with_tick(&tick("BTC/USD", 100.0));
        let second = first.with_tick(&tick("ETH/USD", 10.0));

        assert!(empty.quotes.is_empty());
        assert_eq!(first.sequence, 1);
        assert_eq!(first.quotes.len(), 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.price("BTC/USD"), Some(100.0));
        assert_eq!(second.price("ETH/USD"), Some(10.0));
    }

    #[test]
    fn test_invalid_price_is_hidden() {
        let snapshot = MarketSnapshot::default().with_tick(&tick("BTC/USD", f64::NAN));
        assert!(snapshot.quote("BTC/USD").is_some());
        assert_eq!(snapshot.price("BTC/USD"), None);
    }
}
