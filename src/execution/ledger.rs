use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("insufficient capital: requested ${requested:.2}, available ${available:.2}")]
    InsufficientCapital { requested: f64, available: f64 },

    #[error("exposure cap: committing ${requested:.2} on top of ${committed:.2} exceeds ${limit:.2}")]
    ExposureCap {
        requested: f64,
        committed: f64,
        limit: f64,
    },

    #[error("settling ${amount:.2} but only ${committed:.2} is committed")]
    OverSettle { amount: f64, committed: f64 },
}

/// Serializable ledger balances
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub available: f64,
    pub committed: f64,
    pub max_exposure_fraction: f64,
}

impl LedgerSnapshot {
    pub fn total(&self) -> f64 {
        self.available + self.committed
    }
}

/// Capital debited from the ledger for an admission in flight
///
/// Either becomes part of an open position or goes back via `release`.
#[must_use = "a reservation must be committed to a position or released"]
#[derive(Debug, PartialEq)]
pub struct Reservation {
    amount: f64,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Consume the reservation once the position exists
    pub(crate) fn into_committed(self) -> f64 {
        self.amount
    }
}

/// Single owned record of available vs committed capital
///
/// Shared behind `Arc`. Every debit and credit happens inside one critical
/// section, so two admissions can never spend the same dollars.
#[derive(Debug)]
pub struct CapitalLedger {
    state: Mutex<LedgerSnapshot>,
}

impl CapitalLedger {
    pub fn new(initial_capital: f64, max_exposure_fraction: f64) -> Self {
        Self::from_snapshot(LedgerSnapshot {
            available: initial_capital,
            committed: 0.0,
            max_exposure_fraction,
        })
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerSnapshot> {
        // Balances are plain numbers; a panic elsewhere cannot leave them half-written
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        *self.lock()
    }

    pub fn available(&self) -> f64 {
        self.lock().available
    }

    pub fn committed(&self) -> f64 {
        self.lock().committed
    }

    pub fn total(&self) -> f64 {
        self.lock().total()
    }

    /// Move `amount` from available to committed
    pub fn reserve(&self, amount: f64) -> Result<Reservation, LedgerError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut state = self.lock();

        if amount > state.available + EPSILON {
            return Err(LedgerError::InsufficientCapital {
                requested: amount,
                available: state.available,
            });
        }

        let limit = state.max_exposure_fraction * state.total();
        if state.committed + amount > limit + EPSILON {
            return Err(LedgerError::ExposureCap {
                requested: amount,
                committed: state.committed,
                limit,
            });
        }

        state.available -= amount;
        state.committed += amount;

        tracing::debug!(
            amount,
            available = state.available,
            committed = state.committed,
            "Capital reserved"
        );

        Ok(Reservation { amount })
    }

    /// Return an unused reservation
    pub fn release(&self, reservation: Reservation) {
        let mut state = self.lock();
        state.committed = (state.committed - reservation.amount).max(0.0);
        state.available += reservation.amount;

        tracing::debug!(amount = reservation.amount, "Reservation released");
    }

    /// Credit a closed position: its committed size plus realized P&L
    pub fn settle(&self, committed_amount: f64, realized_pnl: f64) -> Result<f64, LedgerError> {
        let mut state = self.lock();

        if committed_amount > state.committed + EPSILON {
            return Err(LedgerError::OverSettle {
                amount: committed_amount,
                committed: state.committed,
            });
        }

        state.committed = (state.committed - committed_amount).max(0.0);
        state.available += committed_amount + realized_pnl;

        if state.available < 0.0 {
            tracing::warn!(
                available = state.available,
                "Available capital went negative after settlement"
            );
        }

        Ok(state.available)
    }
}
