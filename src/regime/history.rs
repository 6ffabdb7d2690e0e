use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

use crate::models::MarketSnapshot;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Rolling price window per pair, fed from market snapshots
///
/// Only new quotes are appended: a snapshot whose quote for a pair has not
/// changed since the last sample adds nothing for that pair.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    data: HashMap<String, VecDeque<PricePoint>>,
    max_points: usize,
}

impl PriceHistory {
    /// # Arguments
    /// * `max_points` - Maximum number of samples to keep per pair
    pub fn new(max_points: usize) -> Self {
        Self {
            data: HashMap::new(),
            max_points: max_points.max(2),
        }
    }

    /// Append a sample; returns false for stale or invalid samples
    pub fn add_price(&mut self, pair: &str, price: f64, at: DateTime<Utc>) -> bool {
        if !(price.is_finite() && price > 0.0) {
            return false;
        }

        let points = self.data.entry(pair.to_string()).or_default();

        if let Some(last) = points.back() {
            if at <= last.at {
                return false;
            }
        }

        points.push_back(PricePoint { price, at });
        while points.len() > self.max_points {
            points.pop_front();
        }

        true
    }

    /// Sample every valid quote in the snapshot
    pub fn record_snapshot(&mut self, snapshot: &MarketSnapshot) -> usize {
        let mut added = 0;
        for (pair, quote) in &snapshot.quotes {
            if quote.is_valid() && self.add_price(pair, quote.price, quote.updated_at) {
                added += 1;
            }
        }
        added
    }

    pub fn prices(&self, pair: &str) -> Vec<f64> {
        self.data
            .get(pair)
            .map(|points| points.iter().map(|p| p.price).collect())
            .unwrap_or_default()
    }

    /// The N most recent prices, oldest first
    pub fn recent_prices(&self, pair: &str, n: usize) -> Vec<f64> {
        self.data
            .get(pair)
            .map(|points| points.iter().rev().take(n).rev().map(|p| p.price).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, pair: &str) -> usize {
        self.data.get(pair).map(|d| d.len()).unwrap_or(0)
    }

    pub fn pairs(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}
