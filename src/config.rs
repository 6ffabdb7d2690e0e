use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::api::ExchangeConfig;
use crate::db::JournalConfig;
use crate::engine::SchedulerConfig;
use crate::error::EngineError;
use crate::execution::{EvaluatorConfig, LifecycleConfig};
use crate::feed::FeedConfig;
use crate::levels::{default_tiers, LevelRules, Tier};
use crate::persistence::PersistenceConfig;
use crate::regime::{OracleConfig, RegimeConfig};
use crate::risk::{CircuitBreakers, SizingConfig};

pub const ENV_PREFIX: &str = "TIERBOT";

/// Complete engine configuration
///
/// Layered: built-in defaults, then an optional TOML/YAML/JSON file, then
/// `TIERBOT__SECTION__FIELD` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub pairs: Vec<String>,
    pub initial_capital: f64,
    pub max_exposure_fraction: f64,
    /// Quotes older than this are never traded on
    pub max_quote_age_secs: i64,
    pub starting_tier: usize,
    pub tiers: Vec<Tier>,
    pub levels: LevelRules,
    pub sizing: SizingConfig,
    pub evaluator: EvaluatorConfig,
    pub lifecycle: LifecycleConfig,
    pub breakers: CircuitBreakers,
    pub regime: RegimeConfig,
    pub oracle: OracleConfig,
    pub feed: FeedConfig,
    pub exchange: ExchangeConfig,
    pub scheduler: SchedulerConfig,
    pub persistence: PersistenceConfig,
    pub journal: JournalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pairs: vec!["BTC/USD".to_string(), "ETH/USD".to_string()],
            initial_capital: 1_000.0,
            max_exposure_fraction: 0.8, // never commit more than 80%
            max_quote_age_secs: 300,
            starting_tier: 0, // start Conservative
            tiers: default_tiers(),
            levels: LevelRules::default(),
            sizing: SizingConfig::default(),
            evaluator: EvaluatorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            breakers: CircuitBreakers::default(),
            regime: RegimeConfig::default(),
            oracle: OracleConfig::default(),
            feed: FeedConfig::default(),
            exchange: ExchangeConfig::default(),
            scheduler: SchedulerConfig::default(),
            persistence: PersistenceConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate
    ///
    /// Without an explicit path, `tierbot.{toml,yaml,json}` in the working
    /// directory is used when present.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let defaults = ::config::Config::try_from(&EngineConfig::default())?;

        let file = match path {
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::with_name("tierbot").required(false),
        };

        let settings = ::config::Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pairs")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run safely with
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(EngineError::Config(msg));

        if self.pairs.is_empty() {
            return invalid("no pairs configured".to_string());
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return invalid(format!("initial_capital {}", self.initial_capital));
        }
        if !(self.max_exposure_fraction > 0.0 && self.max_exposure_fraction <= 1.0) {
            return invalid(format!(
                "max_exposure_fraction {} outside (0, 1]",
                self.max_exposure_fraction
            ));
        }
        if self.tiers.is_empty() {
            return invalid("tier table is empty".to_string());
        }
        if self.starting_tier >= self.tiers.len() {
            return invalid(format!(
                "starting_tier {} but only {} tiers",
                self.starting_tier,
                self.tiers.len()
            ));
        }
        for tier in &self.tiers {
            tier.validate().map_err(EngineError::Config)?;
        }
        if self.levels.max_downgrade_steps == 0 {
            return invalid("levels.max_downgrade_steps must be at least 1".to_string());
        }
        if self.scheduler.cycle_interval_secs == 0 {
            return invalid("scheduler.cycle_interval_secs must be positive".to_string());
        }
        if !(self.evaluator.fee_pct >= 0.0 && self.evaluator.fee_pct < 1.0) {
            return invalid(format!("evaluator.fee_pct {}", self.evaluator.fee_pct));
        }

        Ok(())
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tiers.len(), 5);
        assert_eq!(config.levels.max_downgrade_steps, 1);
        assert!(!config.lifecycle.close_losing_on_timeout);
        assert_eq!(config.feed.max_reconnect_attempts, None);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
pairs = ["SOL/USD"]
initial_capital = 250.0

[levels]
max_downgrade_steps = 2

[feed]
max_reconnect_attempts = 8
"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.pairs, vec!["SOL/USD".to_string()]);
        assert_eq!(config.initial_capital, 250.0);
        assert_eq!(config.levels.max_downgrade_steps, 2);
        assert_eq!(config.feed.max_reconnect_attempts, Some(8));
        // Untouched sections keep their defaults
        assert_eq!(config.breakers, CircuitBreakers::default());
    }

    #[test]
    fn test_invalid_tier_table_rejected() {
        let mut config = EngineConfig::default();
        config.tiers[0].min_fraction = 0.5;
        config.tiers[0].max_fraction = 0.1;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            starting_tier: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = EngineConfig::load(Some(Path::new("/nonexistent/tierbot.toml")));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
