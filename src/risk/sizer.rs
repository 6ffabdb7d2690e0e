use serde::{Deserialize, Serialize};

use crate::levels::Tier;
use crate::models::Direction;

/// Position sizing parameters shared by every tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizingConfig {
    pub min_position: f64,     // smallest order worth placing, in currency
    pub confidence_base: f64,  // multiplier = base + slope * confidence
    pub confidence_slope: f64,
    pub confidence_floor: f64,
    pub confidence_ceiling: f64,
    /// Ascending (min profit/fee ratio, multiplier) bands
    pub profit_bands: Vec<(f64, f64)>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            min_position: 1.0,
            confidence_base: 0.6,
            confidence_slope: 0.6,
            confidence_floor: 0.8,
            confidence_ceiling: 1.2,
            profit_bands: vec![(50.0, 1.0), (100.0, 1.1), (150.0, 1.2)],
        }
    }
}

impl SizingConfig {
    pub fn confidence_multiplier(&self, confidence: f64) -> f64 {
        (self.confidence_base + self.confidence_slope * confidence)
            .clamp(self.confidence_floor, self.confidence_ceiling)
    }

    /// Step function over the profit bands; 1.0 below the first band
    pub fn profit_ratio_multiplier(&self, ratio: f64) -> f64 {
        self.profit_bands
            .iter()
            .filter(|(threshold, _)| ratio >= *threshold)
            .map(|(_, multiplier)| *multiplier)
            .last()
            .unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingRequest {
    pub capital: f64,
    pub confidence: f64,
    pub expected_profit_pct: f64,
    pub fee_pct: f64,
    pub entry_price: f64,
    pub direction: Direction,
}

impl SizingRequest {
    /// Expected profit over round-trip fee; infinite when trading is free
    pub fn profit_fee_ratio(&self) -> f64 {
        profit_fee_ratio(self.expected_profit_pct, self.fee_pct)
    }
}

pub fn profit_fee_ratio(expected_profit_pct: f64, fee_pct: f64) -> f64 {
    if fee_pct <= 0.0 {
        f64::INFINITY
    } else {
        expected_profit_pct / fee_pct
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionPlan {
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence_multiplier: f64,
    pub profit_multiplier: f64,
}

/// Size a position for the active tier
///
/// Returns `None` when even the largest allowed position is below the
/// minimum order size. Identical inputs always give identical plans.
pub fn size_position(config: &SizingConfig, tier: &Tier, request: &SizingRequest) -> Option<PositionPlan> {
    let ceiling = request.capital * tier.max_fraction;
    if !ceiling.is_finite() || ceiling < config.min_position {
        return None;
    }

    let confidence_multiplier = config.confidence_multiplier(request.confidence);
    let profit_multiplier = config.profit_ratio_multiplier(request.profit_fee_ratio());

    let raw = request.capital * tier.min_fraction * confidence_multiplier * profit_multiplier;
    let size = raw.clamp(config.min_position, ceiling);

    let (stop_loss, take_profit) = tier.protective_prices(request.entry_price, request.direction);

    Some(PositionPlan {
        size,
        stop_loss,
        take_profit,
        confidence_multiplier,
        profit_multiplier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::default_tiers;

    fn tier(min_fraction: f64, max_fraction: f64) -> Tier {
        Tier {
            min_fraction,
            max_fraction,
            ..default_tiers().remove(2)
        }
    }

    fn request(capital: f64, confidence: f64) -> SizingRequest {
        SizingRequest {
            capital,
            confidence,
            expected_profit_pct: 0.08,
            fee_pct: 0.0005,
            entry_price: 100.0,
            direction: Direction::Long,
        }
    }

    #[test]
    fn test_small_account_scenario() {
        // 50 * 0.04 * 1.08 * 1.2
        let plan = size_position(&SizingConfig::default(), &tier(0.04, 0.06), &request(50.0, 0.8)).unwrap();

        assert!((plan.confidence_multiplier - 1.08).abs() < 1e-9);
        assert_eq!(plan.profit_multiplier, 1.2);
        assert!((plan.size - 2.592).abs() < 1e-9);
    }

    #[test]
    fn test_size_is_clamped_to_bounds() {
        let config = SizingConfig::default();

        // Tiny raw size lifted to the minimum
        let plan = size_position(&config, &tier(0.001, 0.5), &request(100.0, 0.0)).unwrap();
        assert_eq!(plan.size, config.min_position);

        // Large raw size capped at capital * max_fraction
        let plan = size_position(&config, &tier(0.5, 0.5), &request(100.0, 1.0)).unwrap();
        assert_eq!(plan.size, 50.0);
    }

    #[test]
    fn test_no_size_when_ceiling_below_minimum() {
        // 10 * 0.05 = 0.5 < 1.0 minimum
        let plan = size_position(&SizingConfig::default(), &tier(0.04, 0.05), &request(10.0, 0.9));
        assert!(plan.is_none());
    }

    #[test]
    fn test_monotonic_in_confidence() {
        let config = SizingConfig::default();
        let tier = tier(0.04, 0.06);

        let mut previous = 0.0;
        for step in 0..=20 {
            let confidence = step as f64 / 20.0;
            let plan = size_position(&config, &tier, &request(1_000.0, confidence)).unwrap();
            assert!(plan.size >= previous);
            assert!(plan.size <= 1_000.0 * tier.max_fraction);
            assert!(plan.size >= config.min_position);
            previous = plan.size;
        }
    }

    #[test]
    fn test_profit_bands() {
        let config = SizingConfig::default();
        assert_eq!(config.profit_ratio_multiplier(10.0), 1.0);
        assert_eq!(config.profit_ratio_multiplier(50.0), 1.0);
        assert_eq!(config.profit_ratio_multiplier(120.0), 1.1);
        assert_eq!(config.profit_ratio_multiplier(f64::INFINITY), 1.2);
    }

    #[test]
    fn test_zero_fee_is_infinite_ratio() {
        assert_eq!(profit_fee_ratio(0.01, 0.0), f64::INFINITY);
    }

    #[test]
    fn test_short_plan_reverses_protection() {
        let mut req = request(1_000.0, 0.7);
        req.direction = Direction::Short;
        let plan = size_position(&SizingConfig::default(), &tier(0.04, 0.06), &req).unwrap();

        assert!(plan.take_profit < 100.0 && 100.0 < plan.stop_loss);
    }
}
