use serde::{Deserialize, Serialize};

use super::tier::Tier;
use crate::error::EngineError;
use crate::regime::{TrendRegime, VolatilityRegime};

/// Transition rules for the tier ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LevelRules {
    pub window_trades: usize,             // rolling window for win rate
    pub min_trades_for_evaluation: usize, // win-rate rules need this many trades
    pub downgrade_win_rate_floor: f64,
    pub downgrade_consecutive_losses: u32,
    pub downgrade_daily_loss_pct: f64,
    pub upgrade_win_rate_ceiling: f64,
    pub upgrade_capital_growth_pct: f64,
    pub growth_window_hours: i64,
    pub upgrade_consecutive_wins: u32,
    /// Most tiers a single cycle may drop; 1 keeps the single-step policy
    pub max_downgrade_steps: usize,
}

impl Default for LevelRules {
    fn default() -> Self {
        Self {
            window_trades: 20,
            min_trades_for_evaluation: 5,
            downgrade_win_rate_floor: 0.40,     // below 40% wins
            downgrade_consecutive_losses: 3,    // 3 losses in a row
            downgrade_daily_loss_pct: 0.03,     // -3% today
            upgrade_win_rate_ceiling: 0.65,     // above 65% wins
            upgrade_capital_growth_pct: 0.05,   // +5% over the growth window
            growth_window_hours: 72,
            upgrade_consecutive_wins: 4,
            max_downgrade_steps: 1,
        }
    }
}

/// Everything the level decision depends on, gathered once per cycle
#[derive(Debug, Clone, PartialEq)]
pub struct LevelInputs {
    pub win_rate: Option<f64>,
    pub trades_in_window: usize,
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub daily_loss_pct: f64, // positive fraction lost since start of day
    pub capital_growth: Option<f64>,
    pub trend: TrendRegime,
    pub volatility: VolatilityRegime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DowngradeTrigger {
    LowWinRate(f64),
    LossStreak(u32),
    DailyLoss(f64),
    HighVolatility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpgradeTrigger {
    HighWinRate(f64),
    CapitalGrowth(f64),
    WinStreak(u32),
    BullishTrend,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TierTransition {
    Hold,
    Downgrade {
        from: usize,
        to: usize,
        triggers: Vec<DowngradeTrigger>,
    },
    Upgrade {
        from: usize,
        to: usize,
        triggers: Vec<UpgradeTrigger>,
    },
}

/// Risk tier state machine
///
/// Exactly one tier is active. `evaluate` is only called at the start of a
/// cycle, so a change never touches an admission already in flight.
#[derive(Debug, Clone)]
pub struct LevelManager {
    tiers: Vec<Tier>,
    rules: LevelRules,
    current: usize,
}

impl LevelManager {
    pub fn new(tiers: Vec<Tier>, rules: LevelRules, start_index: usize) -> crate::Result<Self> {
        if tiers.is_empty() {
            return Err(EngineError::Config("tier table is empty".to_string()));
        }
        if start_index >= tiers.len() {
            return Err(EngineError::Config(format!(
                "initial tier {} out of range (have {})",
                start_index,
                tiers.len()
            )));
        }

        Ok(Self {
            tiers,
            rules,
            current: start_index,
        })
    }

    pub fn current(&self) -> &Tier {
        &self.tiers[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn rules(&self) -> &LevelRules {
        &self.rules
    }

    /// Pure decision for the given inputs; does not change state
    pub fn decide(&self, inputs: &LevelInputs) -> TierTransition {
        let rules = &self.rules;
        let enough_trades = inputs.trades_in_window >= rules.min_trades_for_evaluation;

        // Downgrade conditions take precedence
        let mut down = Vec::new();
        if let Some(rate) = inputs.win_rate.filter(|_| enough_trades) {
            if rate < rules.downgrade_win_rate_floor {
                down.push(DowngradeTrigger::LowWinRate(rate));
            }
        }
        if inputs.consecutive_losses >= rules.downgrade_consecutive_losses {
            down.push(DowngradeTrigger::LossStreak(inputs.consecutive_losses));
        }
        if inputs.daily_loss_pct > rules.downgrade_daily_loss_pct {
            down.push(DowngradeTrigger::DailyLoss(inputs.daily_loss_pct));
        }
        if inputs.volatility == VolatilityRegime::High {
            down.push(DowngradeTrigger::HighVolatility);
        }

        if !down.is_empty() {
            if self.current == 0 {
                return TierTransition::Hold;
            }

            let steps = down.len().min(rules.max_downgrade_steps.max(1));
            return TierTransition::Downgrade {
                from: self.current,
                to: self.current.saturating_sub(steps),
                triggers: down,
            };
        }

        let mut up = Vec::new();
        if let Some(rate) = inputs.win_rate.filter(|_| enough_trades) {
            if rate > rules.upgrade_win_rate_ceiling {
                up.push(UpgradeTrigger::HighWinRate(rate));
            }
        }
        if let Some(growth) = inputs.capital_growth {
            if growth > rules.upgrade_capital_growth_pct {
                up.push(UpgradeTrigger::CapitalGrowth(growth));
            }
        }
        if inputs.consecutive_wins >= rules.upgrade_consecutive_wins {
            up.push(UpgradeTrigger::WinStreak(inputs.consecutive_wins));
        }

        let top = self.tiers.len() - 1;
        if up.is_empty() || inputs.trend == TrendRegime::Bearish || self.current == top {
            return TierTransition::Hold;
        }

        if inputs.trend == TrendRegime::Bullish {
            up.push(UpgradeTrigger::BullishTrend);
        }

        TierTransition::Upgrade {
            from: self.current,
            to: self.current + 1,
            triggers: up,
        }
    }

    /// Decide and apply
    pub fn evaluate(&mut self, inputs: &LevelInputs) -> TierTransition {
        let transition = self.decide(inputs);

        match &transition {
            TierTransition::Hold => {}
            TierTransition::Downgrade { from, to, triggers } => {
                tracing::warn!(
                    from = %self.tiers[*from].name,
                    to = %self.tiers[*to].name,
                    ?triggers,
                    "⬇️  Tier downgrade"
                );
                self.current = *to;
            }
            TierTransition::Upgrade { from, to, triggers } => {
                tracing::info!(
                    from = %self.tiers[*from].name,
                    to = %self.tiers[*to].name,
                    ?triggers,
                    "⬆️  Tier upgrade"
                );
                self.current = *to;
            }
        }

        transition
    }

    /// Restore the active tier from a snapshot
    pub fn restore(&mut self, index: usize, name: &str) -> crate::Result<()> {
        match self.tiers.get(index) {
            Some(tier) if tier.name == name => {
                self.current = index;
                Ok(())
            }
            Some(tier) => Err(EngineError::Fatal(format!(
                "snapshot tier {} '{}' does not match configured '{}'",
                index, name, tier.name
            ))),
            None => Err(EngineError::Fatal(format!(
                "snapshot tier index {} out of range",
                index
            ))),
        }
    }
}
