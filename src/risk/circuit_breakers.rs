use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breakers to prevent catastrophic losses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakers {
    pub max_daily_loss_pct: f64,
    pub emergency_drawdown_pct: f64,
    pub max_consecutive_losses: u32,
    pub cooldown_minutes: i64,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.05,     // -5% daily
            emergency_drawdown_pct: 0.20, // -20% from peak
            max_consecutive_losses: 5,    // 5 losses in a row
            cooldown_minutes: 120,        // pause length after a loss streak
        }
    }
}

/// Everything the safety monitor remembers between cycles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyState {
    pub trading_day: NaiveDate,
    pub day_start_capital: f64,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub consecutive_losses: u32,
    pub paused_until: Option<DateTime<Utc>>,
    pub daily_halt: bool,
    pub emergency: bool,
    pub emergency_reason: Option<String>,
}

impl SafetyState {
    pub fn new(capital: f64, now: DateTime<Utc>) -> Self {
        Self {
            trading_day: now.date_naive(),
            day_start_capital: capital,
            daily_pnl: 0.0,
            daily_trades: 0,
            consecutive_losses: 0,
            paused_until: None,
            daily_halt: false,
            emergency: false,
            emergency_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerTrip {
    DailyLoss,
    ConsecutiveLosses,
    MaxDrawdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyStatus {
    Normal,
    DailyLossHalt,
    Paused { until: DateTime<Utc> },
    Emergency,
}

impl SafetyStatus {
    pub fn is_normal(&self) -> bool {
        matches!(self, SafetyStatus::Normal)
    }
}

/// Independent checks OR'ed together: any one firing changes the state
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    breakers: CircuitBreakers,
    state: SafetyState,
}

impl SafetyMonitor {
    pub fn new(breakers: CircuitBreakers, capital: f64, now: DateTime<Utc>) -> Self {
        Self {
            breakers,
            state: SafetyState::new(capital, now),
        }
    }

    pub fn from_state(breakers: CircuitBreakers, state: SafetyState) -> Self {
        Self { breakers, state }
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Roll the UTC day and expire a finished cool-down
    pub fn tick(&mut self, now: DateTime<Utc>, capital: f64) {
        let today = now.date_naive();
        if today != self.state.trading_day {
            tracing::info!(
                previous = %self.state.trading_day,
                daily_pnl = self.state.daily_pnl,
                trades = self.state.daily_trades,
                "📅 New trading day, daily limits reset"
            );

            self.state.trading_day = today;
            self.state.day_start_capital = capital;
            self.state.daily_pnl = 0.0;
            self.state.daily_trades = 0;
            self.state.daily_halt = false;
        }

        if let Some(until) = self.state.paused_until {
            if now >= until {
                tracing::info!("Loss-streak cool-down elapsed, resuming admissions");
                self.state.paused_until = None;
                self.state.consecutive_losses = 0;
            }
        }
    }

    pub fn record_trade_opened(&mut self) {
        self.state.daily_trades += 1;
    }

    /// Account for a closed trade; returns breakers that fired because of it
    pub fn record_close(&mut self, pnl: f64, now: DateTime<Utc>) -> Vec<CircuitBreakerTrip> {
        let mut trips = Vec::new();
        self.state.daily_pnl += pnl;

        if pnl >= 0.0 {
            if self.state.paused_until.is_some() {
                tracing::info!("Winning trade clears loss-streak pause");
            }
            self.state.consecutive_losses = 0;
            self.state.paused_until = None;
        } else {
            self.state.consecutive_losses += 1;

            if self.state.consecutive_losses >= self.breakers.max_consecutive_losses
                && self.state.paused_until.is_none()
            {
                let until = now + Duration::minutes(self.breakers.cooldown_minutes);
                self.state.paused_until = Some(until);
                tracing::warn!(
                    losses = self.state.consecutive_losses,
                    until = %until,
                    "🛑 Circuit breaker: consecutive losses, admissions paused"
                );
                trips.push(CircuitBreakerTrip::ConsecutiveLosses);
            }
        }

        if !self.state.daily_halt && self.daily_loss_pct() > self.breakers.max_daily_loss_pct {
            self.state.daily_halt = true;
            tracing::warn!(
                loss_pct = self.daily_loss_pct() * 100.0,
                "🛑 Circuit breaker: daily loss limit, admissions halted until rollover"
            );
            trips.push(CircuitBreakerTrip::DailyLoss);
        }

        trips
    }

    /// Raise the emergency flag when drawdown from the high-water mark is too deep
    pub fn check_drawdown(&mut self, equity: f64, high_water_mark: f64) -> Option<CircuitBreakerTrip> {
        if self.state.emergency || high_water_mark <= 0.0 {
            return None;
        }

        let drawdown = (high_water_mark - equity) / high_water_mark;
        if drawdown > self.breakers.emergency_drawdown_pct {
            self.trigger_emergency(format!(
                "drawdown {:.1}% from high-water mark ${:.2}",
                drawdown * 100.0,
                high_water_mark
            ));
            return Some(CircuitBreakerTrip::MaxDrawdown);
        }

        None
    }

    pub fn trigger_emergency(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "🚨 EMERGENCY: liquidating and halting");
        self.state.emergency = true;
        self.state.emergency_reason = Some(reason);
    }

    /// Operator acknowledgement after an emergency
    pub fn reset_emergency(&mut self) {
        if self.state.emergency {
            tracing::info!(
                reason = self.state.emergency_reason.as_deref().unwrap_or("unknown"),
                "Emergency flag cleared by operator"
            );
        }
        self.state.emergency = false;
        self.state.emergency_reason = None;
    }

    /// Realized loss today as a positive fraction of start-of-day capital
    pub fn daily_loss_pct(&self) -> f64 {
        if self.state.day_start_capital <= 0.0 {
            return 0.0;
        }
        (-self.state.daily_pnl / self.state.day_start_capital).max(0.0)
    }

    pub fn status(&self, now: DateTime<Utc>) -> SafetyStatus {
        if self.state.emergency {
            return SafetyStatus::Emergency;
        }
        if self.state.daily_halt {
            return SafetyStatus::DailyLossHalt;
        }
        match self.state.paused_until {
            Some(until) if now < until => SafetyStatus::Paused { until },
            _ => SafetyStatus::Normal,
        }
    }
}
