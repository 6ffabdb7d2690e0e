use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters for reconnects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay to randomize (0 disables jitter)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Delay for a 0-based attempt, before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let clamped = raw.min(self.max_delay_ms as f64);

        Duration::from_millis(clamped as u64)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }

        let millis = delay.as_millis() as f64;
        let range = millis * self.jitter_factor.min(1.0);
        let jitter: f64 = rand::thread_rng().gen_range(-range..=range);
        let jittered = (millis + jitter).clamp(0.0, self.max_delay_ms as f64);

        Duration::from_millis(jittered as u64)
    }
}

/// Stateful delay sequence: base, base*m, base*m^2 ... capped
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.config.with_jitter(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::default());

        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn test_delays_are_non_decreasing() {
        let mut backoff = Backoff::new(BackoffConfig {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            multiplier: 1.5,
            jitter_factor: 0.0,
        });

        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(10_000));
            previous = delay;
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = BackoffConfig {
            jitter_factor: 0.3,
            ..Default::default()
        };
        let mut backoff = Backoff::new(config);

        for _ in 0..20 {
            let attempt = backoff.attempt();
            let nominal = backoff.config().delay_for_attempt(attempt).as_millis() as f64;
            let delay = backoff.next_delay().as_millis() as f64;
            assert!(delay >= nominal * 0.7 - 1.0);
            assert!(delay <= (nominal * 1.3).min(60_000.0) + 1.0);
        }
    }
}
