use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::detector::{RegimeAssessment, TrendRegime};
use super::llm_oracle::{LlmConfig, LlmOracle};
use crate::models::{SignalDirection, SignalSource, TradeSignal};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(String),

    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unparseable reply: {0}")]
    Parse(String),

    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

/// What the oracle is told about one pair
#[derive(Debug, Clone, Serialize)]
pub struct OracleContext {
    pub pair: String,
    pub price: f64,
    pub volume: f64,
    pub assessment: RegimeAssessment,
    pub recent_prices: Vec<f64>,
    pub tier: String,
}

/// External source of trading signals
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, ctx: &OracleContext) -> Result<TradeSignal, OracleError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleBasedConfig {
    pub base_confidence: f64,
    pub spread_weight: f64, // confidence gained per unit of EMA spread
    pub max_confidence: f64,
    pub min_expected_profit_pct: f64,
    pub max_expected_profit_pct: f64,
}

impl Default for RuleBasedConfig {
    fn default() -> Self {
        Self {
            base_confidence: 0.6,
            spread_weight: 10.0,
            max_confidence: 0.85,
            min_expected_profit_pct: 0.02,
            max_expected_profit_pct: 0.10,
        }
    }
}

/// Regime-following default used when no oracle is configured or it fails
#[derive(Debug, Clone, Default)]
pub struct RuleBasedOracle {
    config: RuleBasedConfig,
}

impl RuleBasedOracle {
    pub fn new(config: RuleBasedConfig) -> Self {
        Self { config }
    }

    /// Deterministic signal from the regime assessment alone
    pub fn signal(&self, ctx: &OracleContext) -> TradeSignal {
        let a = &ctx.assessment;
        let direction = match a.trend {
            TrendRegime::Bullish => SignalDirection::Long,
            TrendRegime::Bearish => SignalDirection::Short,
            TrendRegime::Neutral => SignalDirection::Hold,
        };

        let confidence = match direction {
            SignalDirection::Hold => 0.0,
            _ => (self.config.base_confidence + self.config.spread_weight * a.ema_spread.abs())
                .clamp(0.0, self.config.max_confidence),
        };

        let expected_profit_pct = a
            .window_return
            .abs()
            .clamp(self.config.min_expected_profit_pct, self.config.max_expected_profit_pct);

        TradeSignal {
            pair: ctx.pair.clone(),
            direction,
            confidence,
            expected_profit_pct,
            reasoning: format!(
                "{:?} trend, EMA spread {:.2}%, window return {:.2}%",
                a.trend,
                a.ema_spread * 100.0,
                a.window_return * 100.0
            ),
            source: SignalSource::RuleBased,
        }
    }
}

#[async_trait]
impl DecisionOracle for RuleBasedOracle {
    fn name(&self) -> &str {
        "rule-based"
    }

    async fn decide(&self, ctx: &OracleContext) -> Result<TradeSignal, OracleError> {
        Ok(self.signal(ctx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    RuleBased,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleMode {
    RuleBased,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub mode: OracleMode,
    pub timeout_ms: u64,
    pub fallback: FallbackPolicy,
    pub rules: RuleBasedConfig,
    pub llm: LlmConfig,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            mode: OracleMode::RuleBased,
            timeout_ms: 20_000,
            fallback: FallbackPolicy::RuleBased,
            rules: RuleBasedConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Bounds an oracle call and decides what happens when it fails
pub struct GuardedOracle {
    primary: Box<dyn DecisionOracle>,
    fallback: RuleBasedOracle,
    policy: FallbackPolicy,
    timeout: Duration,
}

impl GuardedOracle {
    pub fn new(
        primary: Box<dyn DecisionOracle>,
        fallback: RuleBasedOracle,
        policy: FallbackPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            policy,
            timeout,
        }
    }

    /// Build the configured oracle; an LLM without credentials degrades to rules
    pub fn from_config(config: &OracleConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms.max(1));

        match config.mode {
            OracleMode::RuleBased => Self::rule_based(config.rules.clone()),
            OracleMode::Llm => match LlmOracle::from_env(config.llm.clone()) {
                Ok(llm) => Self::new(
                    Box::new(llm),
                    RuleBasedOracle::new(config.rules.clone()),
                    config.fallback,
                    timeout,
                ),
                Err(e) => {
                    tracing::warn!("LLM oracle unavailable ({}), using rule-based signals", e);
                    Self::rule_based(config.rules.clone())
                }
            },
        }
    }

    pub fn name(&self) -> &str {
        self.primary.name()
    }

    /// Rule engine only, no network
    pub fn rule_based(config: RuleBasedConfig) -> Self {
        Self::new(
            Box::new(RuleBasedOracle::new(config.clone())),
            RuleBasedOracle::new(config),
            FallbackPolicy::Skip,
            Duration::from_secs(1),
        )
    }

    /// Signal for this cycle, or `None` to skip the pair
    pub async fn decide(&self, ctx: &OracleContext) -> Option<TradeSignal> {
        let result = match tokio::time::timeout(self.timeout, self.primary.decide(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(self.timeout)),
        };

        match result {
            Ok(signal) if signal.pair == ctx.pair => Some(signal),
            Ok(signal) => {
                tracing::warn!(
                    oracle = self.primary.name(),
                    expected = %ctx.pair,
                    got = %signal.pair,
                    "Oracle answered for the wrong pair"
                );
                self.fall_back(ctx)
            }
            Err(e) => {
                tracing::warn!(oracle = self.primary.name(), pair = %ctx.pair, "⚠️  Oracle failed: {}", e);
                self.fall_back(ctx)
            }
        }
    }

    fn fall_back(&self, ctx: &OracleContext) -> Option<TradeSignal> {
        match self.policy {
            FallbackPolicy::RuleBased => Some(self.fallback.signal(ctx)),
            FallbackPolicy::Skip => None,
        }
    }
}
