use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{ExchangeAdapter, ExchangeError, Fill, PriceQuote};
use crate::feed::SnapshotReader;
use crate::models::OrderSide;

pub const QUOTE_CURRENCY: &str = "USD";

/// Simulated exchange filling at the latest streamed price
///
/// Keeps a quote-currency cash balance so `fetch_balance` reflects trading.
pub struct PaperExchange {
    reader: SnapshotReader,
    fee_pct: f64,
    cash: Mutex<f64>,
    failures_pending: AtomicU32,
}

impl PaperExchange {
    pub fn new(reader: SnapshotReader, initial_cash: f64, fee_pct: f64) -> Self {
        Self {
            reader,
            fee_pct: fee_pct.max(0.0),
            cash: Mutex::new(initial_cash),
            failures_pending: AtomicU32::new(0),
        }
    }

    /// Reject the next `count` orders
    pub fn fail_next_orders(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn cash(&self) -> f64 {
        *self.cash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latest_price(&self, pair: &str) -> Result<f64, ExchangeError> {
        let snapshot = self.reader.latest();
        match snapshot.quote(pair) {
            None => Err(ExchangeError::UnknownPair(pair.to_string())),
            Some(quote) if quote.is_valid() => Ok(quote.price),
            Some(quote) => Err(ExchangeError::InvalidResponse(format!(
                "{}: price {}",
                pair, quote.price
            ))),
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn fetch_price(&self, pair: &str) -> Result<PriceQuote, ExchangeError> {
        let snapshot = self.reader.latest();
        let price = self.latest_price(pair)?;
        let volume = snapshot.quote(pair).map(|q| q.volume).unwrap_or_default();
        Ok(PriceQuote { price, volume })
    }

    async fn place_market_order(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<Fill, ExchangeError> {
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(ExchangeError::Rejected(format!("invalid quantity {}", quantity)));
        }
        if self.take_failure() {
            return Err(ExchangeError::Rejected("simulated rejection".to_string()));
        }

        let price = self.latest_price(pair)?;
        let notional = price * quantity;
        let fee = notional * self.fee_pct;

        let mut cash = self.cash.lock().unwrap_or_else(PoisonError::into_inner);
        match side {
            OrderSide::Buy => {
                if *cash < notional + fee {
                    return Err(ExchangeError::InsufficientFunds(format!(
                        "need ${:.2}, have ${:.2}",
                        notional + fee,
                        *cash
                    )));
                }
                *cash -= notional + fee;
            }
            OrderSide::Sell => *cash += notional - fee,
        }

        tracing::debug!(pair, side = ?side, price, quantity, fee, "📝 Paper fill");

        Ok(Fill {
            price,
            quantity,
            fee,
        })
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(HashMap::from([(QUOTE_CURRENCY.to_string(), self.cash())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::snapshot_channel;
    use crate::models::Tick;
    use chrono::Utc;

    fn exchange_with(pair: &str, price: f64) -> (PaperExchange, crate::feed::SnapshotPublisher) {
        let (publisher, reader) = snapshot_channel();
        publisher.apply(&Tick {
            pair: pair.to_string(),
            price,
            volume: 5.0,
            timestamp: Utc::now(),
        });
        (PaperExchange::new(reader, 1_000.0, 0.001), publisher)
    }

    #[tokio::test]
    async fn test_fills_at_latest_price_with_fee() {
        let (exchange, _publisher) = exchange_with("BTC/USD", 100.0);

        let fill = exchange
            .place_market_order("BTC/USD", OrderSide::Buy, 2.0)
            .await
            .unwrap();

        assert_eq!(fill.price, 100.0);
        assert!((fill.fee - 0.2).abs() < 1e-12);
        assert!((exchange.cash() - 799.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_pair() {
        let (exchange, _publisher) = exchange_with("BTC/USD", 100.0);
        let result = exchange.fetch_price("DOGE/USD").await;
        assert!(matches!(result, Err(ExchangeError::UnknownPair(_))));
    }

    #[tokio::test]
    async fn test_insufficient_cash() {
        let (exchange, _publisher) = exchange_with("BTC/USD", 100.0);
        let result = exchange.place_market_order("BTC/USD", OrderSide::Buy, 20.0).await;
        assert!(matches!(result, Err(ExchangeError::InsufficientFunds(_))));
        assert_eq!(exchange.cash(), 1_000.0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let (exchange, _publisher) = exchange_with("BTC/USD", 100.0);
        exchange.fail_next_orders(1);

        assert!(exchange
            .place_market_order("BTC/USD", OrderSide::Sell, 1.0)
            .await
            .is_err());
        assert!(exchange
            .place_market_order("BTC/USD", OrderSide::Sell, 1.0)
            .await
            .is_ok());
    }
}
