use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MAX_CAPITAL_POINTS: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TradeOutcome {
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        self.pnl >= 0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CapitalPoint {
    pub at: DateTime<Utc>,
    pub capital: f64,
}

/// Rolling trade performance, updated on every close
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceWindow {
    window_size: usize,
    recent: VecDeque<TradeOutcome>,
    pub total_wins: u32,
    pub total_losses: u32,
    pub realized_pnl: f64,
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub high_water_mark: f64,
    capital_history: VecDeque<CapitalPoint>,
}

impl PerformanceWindow {
    pub fn new(window_size: usize, initial_capital: f64, now: DateTime<Utc>) -> Self {
        let mut capital_history = VecDeque::new();
        capital_history.push_back(CapitalPoint {
            at: now,
            capital: initial_capital,
        });

        Self {
            window_size: window_size.max(1),
            recent: VecDeque::new(),
            total_wins: 0,
            total_losses: 0,
            realized_pnl: 0.0,
            consecutive_losses: 0,
            consecutive_wins: 0,
            high_water_mark: initial_capital,
            capital_history,
        }
    }

    /// Record a closed trade and the capital it left behind
    pub fn record_close(&mut self, pnl: f64, closed_at: DateTime<Utc>, capital_after: f64) {
        let outcome = TradeOutcome { pnl, closed_at };

        if outcome.is_win() {
            self.total_wins += 1;
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.total_losses += 1;
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
        }

        self.realized_pnl += pnl;
        self.recent.push_back(outcome);
        while self.recent.len() > self.window_size {
            self.recent.pop_front();
        }

        self.observe_capital(capital_after, closed_at);
    }

    /// Track total capital for drawdown and trailing growth
    pub fn observe_capital(&mut self, capital: f64, at: DateTime<Utc>) {
        if !capital.is_finite() {
            return;
        }

        if capital > self.high_water_mark {
            self.high_water_mark = capital;
        }

        self.capital_history.push_back(CapitalPoint { at, capital });
        while self.capital_history.len() > MAX_CAPITAL_POINTS {
            self.capital_history.pop_front();
        }
    }

    /// Trades currently in the rolling window
    pub fn recent_trades(&self) -> usize {
        self.recent.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Win rate over the rolling window, `None` before any trade
    pub fn win_rate(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }

        let wins = self.recent.iter().filter(|o| o.is_win()).count();
        Some(wins as f64 / self.recent.len() as f64)
    }

    /// Fractional decline of `capital` from the high-water mark
    pub fn drawdown(&self, capital: f64) -> f64 {
        if self.high_water_mark <= 0.0 {
            return 0.0;
        }
        ((self.high_water_mark - capital) / self.high_water_mark).max(0.0)
    }

    /// Capital growth over the trailing window ending at `now`
    pub fn growth_since(&self, now: DateTime<Utc>, window: Duration, current: f64) -> Option<f64> {
        let cutoff = now - window;

        let baseline = self
            .capital_history
            .iter()
            .rev()
            .find(|p| p.at <= cutoff)
            .or_else(|| self.capital_history.front())?;

        if baseline.capital <= 0.0 {
            return None;
        }

        Some((current - baseline.capital) / baseline.capital)
    }
}
