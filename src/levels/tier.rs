use serde::{Deserialize, Serialize};

use crate::models::Direction;

/// Named risk configuration
///
/// Tiers are plain data; the sizer and evaluator read them through the same
/// fixed interface regardless of which tier is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tier {
    pub name: String,
    pub min_fraction: f64,            // of capital, base position size
    pub max_fraction: f64,            // of capital, hard cap
    pub stop_loss_pct: f64,           // 0.02 = 2%
    pub take_profit_pct: f64,         // 0.04 = 4%
    pub confidence_threshold: f64,    // minimum oracle confidence
    pub min_profit_fee_ratio: f64,    // expected profit / fee
    pub max_open_positions: usize,    // pair-count ceiling
}

impl Tier {
    /// Stop-loss and take-profit prices for an entry
    pub fn protective_prices(&self, entry_price: f64, direction: Direction) -> (f64, f64) {
        protective_prices(entry_price, direction, self.stop_loss_pct, self.take_profit_pct)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("tier name is empty".to_string());
        }
        if !(self.min_fraction > 0.0 && self.min_fraction <= self.max_fraction) {
            return Err(format!(
                "{}: need 0 < min_fraction <= max_fraction",
                self.name
            ));
        }
        if self.max_fraction > 1.0 {
            return Err(format!("{}: max_fraction above 1.0", self.name));
        }
        if !(self.stop_loss_pct > 0.0 && self.stop_loss_pct < 1.0) {
            return Err(format!("{}: stop_loss_pct must be in (0, 1)", self.name));
        }
        if self.take_profit_pct <= 0.0 {
            return Err(format!("{}: take_profit_pct must be positive", self.name));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "{}: confidence_threshold must be in [0, 1]",
                self.name
            ));
        }
        if self.max_open_positions == 0 {
            return Err(format!("{}: max_open_positions is zero", self.name));
        }
        Ok(())
    }
}

/// SL/TP for a direction: long has SL below and TP above entry, short the reverse
pub fn protective_prices(
    entry_price: f64,
    direction: Direction,
    stop_loss_pct: f64,
    take_profit_pct: f64,
) -> (f64, f64) {
    match direction {
        Direction::Long => (
            entry_price * (1.0 - stop_loss_pct),
            entry_price * (1.0 + take_profit_pct),
        ),
        Direction::Short => (
            entry_price * (1.0 + stop_loss_pct),
            entry_price * (1.0 - take_profit_pct),
        ),
    }
}

fn tier(
    name: &str,
    fractions: (f64, f64),
    stop_loss_pct: f64,
    take_profit_pct: f64,
    confidence_threshold: f64,
    max_open_positions: usize,
) -> Tier {
    Tier {
        name: name.to_string(),
        min_fraction: fractions.0,
        max_fraction: fractions.1,
        stop_loss_pct,
        take_profit_pct,
        confidence_threshold,
        min_profit_fee_ratio: 50.0,
        max_open_positions,
    }
}

/// Default ladder, conservative first
pub fn default_tiers() -> Vec<Tier> {
    vec![
        tier("Conservative", (0.02, 0.03), 0.015, 0.03, 0.75, 1),
        tier("Cautious", (0.03, 0.045), 0.02, 0.04, 0.70, 2),
        tier("Balanced", (0.04, 0.06), 0.025, 0.05, 0.65, 3),
        tier("Growth", (0.05, 0.08), 0.03, 0.06, 0.62, 4),
        tier("Aggressive", (0.06, 0.10), 0.04, 0.08, 0.60, 5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tiers_are_valid_and_ordered() {
        let tiers = default_tiers();
        assert_eq!(tiers.len(), 5);

        for tier in &tiers {
            tier.validate().unwrap();
        }

        for pair in tiers.windows(2) {
            assert!(pair[1].max_fraction >= pair[0].max_fraction);
            assert!(pair[1].confidence_threshold <= pair[0].confidence_threshold);
            assert!(pair[1].max_open_positions >= pair[0].max_open_positions);
        }
    }

    #[test]
    fn test_protective_prices_bracket_entry() {
        for tier in default_tiers() {
            let (sl, tp) = tier.protective_prices(100.0, Direction::Long);
            assert!(sl < 100.0 && 100.0 < tp, "{}", tier.name);

            let (sl, tp) = tier.protective_prices(100.0, Direction::Short);
            assert!(tp < 100.0 && 100.0 < sl, "{}", tier.name);
        }
    }

    #[test]
    fn test_validate_rejects_inverted_fractions() {
        let mut tier = default_tiers().remove(0);
        tier.min_fraction = 0.5;
        tier.max_fraction = 0.1;
        assert!(tier.validate().is_err());
    }
}
