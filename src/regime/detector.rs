/// Trend and volatility regime from a price window
///
/// - Bullish: fast EMA above slow EMA by the trend threshold and the window is up
/// - Bearish: the mirror image
/// - High volatility: standard deviation of returns above the threshold
use serde::{Deserialize, Serialize};
use yata::core::Method;
use yata::methods::{StDev, EMA};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendRegime {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolatilityRegime {
    High,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeAssessment {
    pub trend: TrendRegime,
    pub volatility: VolatilityRegime,
    pub ema_spread: f64,    // (fast - slow) / slow
    pub window_return: f64, // last / first - 1
    pub return_stdev: f64,
    pub samples: usize,
}

impl Default for RegimeAssessment {
    fn default() -> Self {
        Self {
            trend: TrendRegime::Neutral,
            volatility: VolatilityRegime::Normal,
            ema_spread: 0.0,
            window_return: 0.0,
            return_stdev: 0.0,
            samples: 0,
        }
    }
}

impl RegimeAssessment {
    /// Market-wide view: any high-volatility pair flags the market,
    /// trend follows the majority of pairs
    pub fn aggregate<'a>(assessments: impl IntoIterator<Item = &'a RegimeAssessment>) -> Self {
        let mut bullish = 0usize;
        let mut bearish = 0usize;
        let mut high_vol = false;
        let mut samples = 0usize;

        for a in assessments {
            match a.trend {
                TrendRegime::Bullish => bullish += 1,
                TrendRegime::Bearish => bearish += 1,
                TrendRegime::Neutral => {}
            }
            high_vol |= a.volatility == VolatilityRegime::High;
            samples += a.samples;
        }

        let trend = if bullish > bearish {
            TrendRegime::Bullish
        } else if bearish > bullish {
            TrendRegime::Bearish
        } else {
            TrendRegime::Neutral
        };

        Self {
            trend,
            volatility: if high_vol {
                VolatilityRegime::High
            } else {
                VolatilityRegime::Normal
            },
            samples,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegimeConfig {
    pub fast_period: u8,
    pub slow_period: u8,
    pub volatility_period: u8,
    pub min_samples: usize,
    pub trend_threshold_pct: f64,
    pub volatility_threshold: f64,
    pub history_points: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            fast_period: 12,
            slow_period: 26,
            volatility_period: 20,
            min_samples: 30,
            trend_threshold_pct: 0.005, // EMAs 0.5% apart
            volatility_threshold: 0.03, // 3% stdev per sample
            history_points: 200,
        }
    }
}

pub struct RegimeDetector {
    config: RegimeConfig,
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new(RegimeConfig::default())
    }
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// Assess a window of prices, oldest first
    ///
    /// Too little data, or an indicator that cannot be built, reads as
    /// Neutral / Normal.
    pub fn assess(&self, prices: &[f64]) -> RegimeAssessment {
        let samples = prices.len();
        if samples < self.config.min_samples.max(2) {
            return RegimeAssessment {
                samples,
                ..Default::default()
            };
        }

        let (ema_spread, return_stdev) = match self.indicators(prices) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!("Regime indicators unavailable: {}", e);
                return RegimeAssessment {
                    samples,
                    ..Default::default()
                };
            }
        };

        let first = prices[0];
        let last = prices[samples - 1];
        let window_return = if first > 0.0 { last / first - 1.0 } else { 0.0 };

        let threshold = self.config.trend_threshold_pct;
        let trend = if ema_spread > threshold && window_return > 0.0 {
            TrendRegime::Bullish
        } else if ema_spread < -threshold && window_return < 0.0 {
            TrendRegime::Bearish
        } else {
            TrendRegime::Neutral
        };

        let volatility = if return_stdev > self.config.volatility_threshold {
            VolatilityRegime::High
        } else {
            VolatilityRegime::Normal
        };

        RegimeAssessment {
            trend,
            volatility,
            ema_spread,
            window_return,
            return_stdev,
            samples,
        }
    }

    fn indicators(&self, prices: &[f64]) -> Result<(f64, f64), String> {
        let first = prices[0];
        let mut fast = EMA::new(self.config.fast_period.max(1), &first).map_err(|e| format!("{:?}", e))?;
        let mut slow = EMA::new(self.config.slow_period.max(1), &first).map_err(|e| format!("{:?}", e))?;

        let mut fast_value = first;
        let mut slow_value = first;
        for price in prices {
            fast_value = fast.next(price);
            slow_value = slow.next(price);
        }

        let ema_spread = if slow_value > 0.0 {
            (fast_value - slow_value) / slow_value
        } else {
            0.0
        };

        let returns: Vec<f64> = prices
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();

        let period = self
            .config
            .volatility_period
            .max(2)
            .min(returns.len().clamp(2, u8::MAX as usize) as u8);
        let mut stdev = StDev::new(period, &returns[0]).map_err(|e| format!("{:?}", e))?;
        let mut return_stdev = 0.0;
        for r in &returns {
            return_stdev = stdev.next(r);
        }

        Ok((ema_spread, return_stdev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(start: f64, step_pct: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start * (1.0 + step_pct).powi(i as i32)).collect()
    }

    #[test]
    fn test_insufficient_data_is_neutral() {
        let detector = RegimeDetector::default();
        let assessment = detector.assess(&[100.0, 101.0, 102.0]);
        assert_eq!(assessment.trend, TrendRegime::Neutral);
        assert_eq!(assessment.volatility, VolatilityRegime::Normal);
        assert_eq!(assessment.samples, 3);
    }

    #[test]
    fn test_rising_market_is_bullish() {
        let detector = RegimeDetector::default();
        let assessment = detector.assess(&series(100.0, 0.01, 60));
        assert_eq!(assessment.trend, TrendRegime::Bullish);
        assert_eq!(assessment.volatility, VolatilityRegime::Normal);
        assert!(assessment.window_return > 0.5);
    }

    #[test]
    fn test_falling_market_is_bearish() {
        let detector = RegimeDetector::default();
        let assessment = detector.assess(&series(100.0, -0.01, 60));
        assert_eq!(assessment.trend, TrendRegime::Bearish);
    }

    #[test]
    fn test_whipsaw_is_high_volatility() {
        let detector = RegimeDetector::default();
        let prices: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 100.0 } else { 110.0 })
            .collect();

        let assessment = detector.assess(&prices);
        assert_eq!(assessment.volatility, VolatilityRegime::High);
    }

    #[test]
    fn test_aggregate_majority_and_any_volatility() {
        let bull = RegimeAssessment {
            trend: TrendRegime::Bullish,
            ..Default::default()
        };
        let bear_volatile = RegimeAssessment {
            trend: TrendRegime::Bearish,
            volatility: VolatilityRegime::High,
            ..Default::default()
        };

        let all = [bull, bull, bear_volatile];
        let market = RegimeAssessment::aggregate(all.iter());
        assert_eq!(market.trend, TrendRegime::Bullish);
        assert_eq!(market.volatility, VolatilityRegime::High);

        let tie = [bull, bear_volatile];
        assert_eq!(RegimeAssessment::aggregate(tie.iter()).trend, TrendRegime::Neutral);
    }
}
