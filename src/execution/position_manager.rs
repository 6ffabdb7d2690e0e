use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::ledger::{CapitalLedger, LedgerError, Reservation};
use crate::api::Fill;
use crate::levels::{protective_prices, PerformanceWindow};
use crate::models::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing, // exit order in flight
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    MaxHoldingTime,
    Emergency,     // safety monitor drawdown flag
    EmergencyStop, // operator / signal shutdown
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub armed: bool,
    pub peak_price: f64,   // best price seen since arming
    pub distance_pct: f64, // retrace from peak that closes
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub pair: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub size: f64,     // committed currency
    pub quantity: f64, // base units filled
    pub fees: f64,     // entry fee paid
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing: TrailingStop,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub close_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
    pub exit_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub tier: String,
}

impl Position {
    /// Unrealized P&L as a fraction of entry, positive when winning
    pub fn pnl_pct(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) / self.entry_price
    }

    /// Unrealized P&L in currency, before exit fees
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * self.quantity - self.fees
    }

    fn hits_stop_loss(&self, price: f64) -> bool {
        match self.direction {
            Direction::Long => price <= self.stop_loss,
            Direction::Short => price >= self.stop_loss,
        }
    }

    fn hits_take_profit(&self, price: f64) -> bool {
        match self.direction {
            Direction::Long => price >= self.take_profit,
            Direction::Short => price <= self.take_profit,
        }
    }

    /// Arm once profit reaches activation, then follow the best price
    fn update_trailing(&mut self, price: f64, activation_pct: f64) {
        if !self.trailing.armed {
            if self.pnl_pct(price) >= activation_pct {
                self.trailing.armed = true;
                self.trailing.peak_price = price;
                tracing::debug!(pair = %self.pair, price, "Trailing stop armed");
            }
            return;
        }

        let better = match self.direction {
            Direction::Long => price > self.trailing.peak_price,
            Direction::Short => price < self.trailing.peak_price,
        };
        if better {
            self.trailing.peak_price = price;
        }
    }

    fn trailing_retrace(&self, price: f64) -> f64 {
        let peak = self.trailing.peak_price;
        self.direction.sign() * (peak - price) / peak
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub trailing_activation_pct: f64,
    pub trailing_distance_pct: f64,
    pub max_holding_hours: i64,
    /// Whether the holding timeout also closes positions that are under water
    pub close_losing_on_timeout: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            trailing_activation_pct: 0.02, // arm at +2%
            trailing_distance_pct: 0.01,   // close on 1% retrace from peak
            max_holding_hours: 48,
            close_losing_on_timeout: false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("position {id} is {status:?}, expected {expected:?}")]
    InvalidStatus {
        id: Uuid,
        status: PositionStatus,
        expected: PositionStatus,
    },

    #[error("{0}: already holding a position")]
    DuplicatePair(String),

    #[error("tier ceiling of {0} open positions reached")]
    CeilingReached(usize),

    #[error("invalid fill: {0}")]
    InvalidFill(String),

    #[error("restored positions inconsistent with ledger: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What the admission step knows before the order goes out
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub pair: String,
    pub direction: Direction,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub tier: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub position_id: Uuid,
    pub pair: String,
    pub price: f64,
    pub reason: ExitReason,
}

/// Result of one exit pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitSweep {
    pub exits: Vec<ExitSignal>,
    /// Positions that could not be evaluated this tick, with the reason
    pub skipped: Vec<(Uuid, String)>,
}

/// Owns every open position
///
/// Capital moves only through the shared ledger: admission consumes a
/// reservation, closing settles size plus realized P&L.
pub struct PositionManager {
    positions: Vec<Position>,
    ledger: Arc<CapitalLedger>,
    config: LifecycleConfig,
    performance: PerformanceWindow,
}

impl PositionManager {
    pub fn new(
        ledger: Arc<CapitalLedger>,
        config: LifecycleConfig,
        performance: PerformanceWindow,
    ) -> Self {
        Self {
            positions: Vec::new(),
            ledger,
            config,
            performance,
        }
    }

    /// Rebuild from persisted positions
    ///
    /// Committed capital in the ledger must equal the sum of position sizes.
    pub fn restore(
        ledger: Arc<CapitalLedger>,
        config: LifecycleConfig,
        performance: PerformanceWindow,
        positions: Vec<Position>,
    ) -> Result<Self, PositionError> {
        let committed: f64 = positions.iter().map(|p| p.size).sum();
        let ledger_committed = ledger.committed();

        if (committed - ledger_committed).abs() > 1e-6 {
            return Err(PositionError::Inconsistent(format!(
                "positions hold ${:.2} but ledger has ${:.2} committed",
                committed, ledger_committed
            )));
        }

        if let Some(p) = positions.iter().find(|p| p.status == PositionStatus::Closed) {
            return Err(PositionError::Inconsistent(format!(
                "closed position {} in open set",
                p.id
            )));
        }

        // An exit order cannot survive a restart; re-evaluate from scratch
        let positions = positions
            .into_iter()
            .map(|mut p| {
                p.status = PositionStatus::Open;
                p
            })
            .collect::<Vec<_>>();

        tracing::info!(
            "Restored {} open positions from snapshot (committed: ${:.2})",
            positions.len(),
            committed
        );

        Ok(Self {
            positions,
            ledger,
            config,
            performance,
        })
    }

    pub fn ledger(&self) -> &Arc<CapitalLedger> {
        &self.ledger
    }

    pub fn performance(&self) -> &PerformanceWindow {
        &self.performance
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Open and closing positions
    pub fn open_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn get_position(&self, id: Uuid) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    fn get_position_mut(&mut self, id: Uuid) -> Result<&mut Position, PositionError> {
        self.positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(PositionError::NotFound(id))
    }

    pub fn has_position(&self, pair: &str) -> bool {
        self.positions.iter().any(|p| p.pair == pair)
    }

    /// Admission pre-check: pair free, under the tier ceiling, capital available
    pub fn check_capacity(&self, pair: &str, size: f64, ceiling: usize) -> Result<(), PositionError> {
        if self.has_position(pair) {
            return Err(PositionError::DuplicatePair(pair.to_string()));
        }

        if self.positions.len() >= ceiling {
            return Err(PositionError::CeilingReached(ceiling));
        }

        let available = self.ledger.available();
        if available < size {
            return Err(PositionError::Ledger(LedgerError::InsufficientCapital {
                requested: size,
                available,
            }));
        }

        Ok(())
    }

    /// Turn a filled entry into a tracked position
    ///
    /// On any error the reservation goes back to the ledger.
    pub fn open_position(
        &mut self,
        reservation: Reservation,
        request: OpenRequest,
        fill: &Fill,
        now: DateTime<Utc>,
    ) -> Result<Uuid, PositionError> {
        let problem = if self.has_position(&request.pair) {
            Some(PositionError::DuplicatePair(request.pair.clone()))
        } else if !(fill.price.is_finite() && fill.price > 0.0) {
            Some(PositionError::InvalidFill(format!("price {}", fill.price)))
        } else if !(fill.quantity.is_finite() && fill.quantity > 0.0) {
            Some(PositionError::InvalidFill(format!("quantity {}", fill.quantity)))
        } else {
            None
        };

        if let Some(err) = problem {
            self.ledger.release(reservation);
            return Err(err);
        }

        let (stop_loss, take_profit) = protective_prices(
            fill.price,
            request.direction,
            request.stop_loss_pct,
            request.take_profit_pct,
        );

        let id = Uuid::new_v4();
        let size = reservation.into_committed();

        let position = Position {
            id,
            pair: request.pair,
            direction: request.direction,
            entry_price: fill.price,
            size,
            quantity: fill.quantity,
            fees: fill.fee.max(0.0),
            stop_loss,
            take_profit,
            trailing: TrailingStop {
                armed: false,
                peak_price: fill.price,
                distance_pct: self.config.trailing_distance_pct,
            },
            opened_at: now,
            status: PositionStatus::Open,
            close_reason: None,
            realized_pnl: None,
            exit_price: None,
            closed_at: None,
            tier: request.tier,
        };

        tracing::info!(
            id = %id,
            pair = %position.pair,
            direction = ?position.direction,
            entry = position.entry_price,
            size = position.size,
            stop_loss = position.stop_loss,
            take_profit = position.take_profit,
            "📈 Position opened"
        );

        self.positions.push(position);
        Ok(id)
    }

    /// Exit pass over every open position
    ///
    /// Each position is judged on its own price only. A missing or invalid
    /// price skips that position and nothing else.
    pub fn evaluate_exits(
        &mut self,
        prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
        emergency: bool,
    ) -> ExitSweep {
        let mut sweep = ExitSweep::default();
        let activation = self.config.trailing_activation_pct;
        let max_holding = Duration::hours(self.config.max_holding_hours);
        let close_losing = self.config.close_losing_on_timeout;

        for position in self
            .positions
            .iter_mut()
            .filter(|p| p.status == PositionStatus::Open)
        {
            let price = match prices.get(&position.pair) {
                Some(&price) if price.is_finite() && price > 0.0 => price,
                Some(&price) => {
                    tracing::warn!(pair = %position.pair, price, "Invalid price, skipping exit check");
                    sweep
                        .skipped
                        .push((position.id, format!("invalid price {}", price)));
                    continue;
                }
                None => {
                    tracing::warn!(pair = %position.pair, "No price, skipping exit check");
                    sweep.skipped.push((position.id, "no price".to_string()));
                    continue;
                }
            };

            position.update_trailing(price, activation);

            let reason = if emergency {
                Some(ExitReason::Emergency)
            } else if position.hits_stop_loss(price) {
                Some(ExitReason::StopLoss)
            } else if position.hits_take_profit(price) {
                Some(ExitReason::TakeProfit)
            } else if position.trailing.armed
                && position.trailing_retrace(price) > position.trailing.distance_pct
            {
                Some(ExitReason::TrailingStop)
            } else if now - position.opened_at >= max_holding {
                if position.pnl_pct(price) > 0.0 || close_losing {
                    Some(ExitReason::MaxHoldingTime)
                } else {
                    tracing::debug!(pair = %position.pair, "Holding timeout reached while losing, holding");
                    None
                }
            } else {
                None
            };

            if let Some(reason) = reason {
                sweep.exits.push(ExitSignal {
                    position_id: position.id,
                    pair: position.pair.clone(),
                    price,
                    reason,
                });
            }
        }

        sweep
    }

    /// Open -> Closing while the exit order is in flight
    pub fn mark_closing(&mut self, id: Uuid) -> Result<(), PositionError> {
        let position = self.get_position_mut(id)?;
        if position.status != PositionStatus::Open {
            return Err(PositionError::InvalidStatus {
                id,
                status: position.status,
                expected: PositionStatus::Open,
            });
        }
        position.status = PositionStatus::Closing;
        Ok(())
    }

    /// Closing -> Open after a failed exit order
    pub fn revert_closing(&mut self, id: Uuid) -> Result<(), PositionError> {
        let position = self.get_position_mut(id)?;
        if position.status != PositionStatus::Closing {
            return Err(PositionError::InvalidStatus {
                id,
                status: position.status,
                expected: PositionStatus::Closing,
            });
        }
        position.status = PositionStatus::Open;
        Ok(())
    }

    /// Archive a position: credit the ledger and record the outcome
    pub fn close_position(
        &mut self,
        id: Uuid,
        exit_price: f64,
        exit_fee: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Position, PositionError> {
        let index = self
            .positions
            .iter()
            .position(|p| p.id == id)
            .ok_or(PositionError::NotFound(id))?;

        if !(exit_price.is_finite() && exit_price > 0.0) {
            return Err(PositionError::InvalidFill(format!("exit price {}", exit_price)));
        }

        let mut position = self.positions.remove(index);
        let pnl = position.unrealized_pnl(exit_price) - exit_fee.max(0.0);

        if let Err(e) = self.ledger.settle(position.size, pnl) {
            self.positions.insert(index, position);
            return Err(e.into());
        }

        position.status = PositionStatus::Closed;
        position.close_reason = Some(reason);
        position.realized_pnl = Some(pnl);
        position.exit_price = Some(exit_price);
        position.closed_at = Some(now);
        position.fees += exit_fee.max(0.0);

        self.performance.record_close(pnl, now, self.ledger.total());

        tracing::info!(
            id = %id,
            pair = %position.pair,
            reason = ?reason,
            exit = exit_price,
            pnl = pnl,
            "{} Position closed",
            if pnl >= 0.0 { "✅" } else { "🔻" }
        );

        Ok(position)
    }

    /// Sum of unrealized P&L over positions that have a price
    pub fn unrealized_pnl(&self, prices: &HashMap<String, f64>) -> f64 {
        self.positions
            .iter()
            .filter_map(|p| {
                prices
                    .get(&p.pair)
                    .filter(|price| price.is_finite() && **price > 0.0)
                    .map(|&price| p.unrealized_pnl(price))
            })
            .sum()
    }

    /// Ledger total plus unrealized P&L; also moves the high-water mark
    pub fn observe_equity(&mut self, prices: &HashMap<String, f64>, now: DateTime<Utc>) -> f64 {
        let equity = self.ledger.total() + self.unrealized_pnl(prices);
        self.performance.observe_capital(equity, now);
        equity
    }
}
