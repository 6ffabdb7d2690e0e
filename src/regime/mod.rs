// Market regime and decision oracle module
pub mod detector;
pub mod history;
pub mod llm_oracle;
pub mod oracle;

pub use detector::{RegimeAssessment, RegimeConfig, RegimeDetector, TrendRegime, VolatilityRegime};
pub use history::{PricePoint, PriceHistory};
pub use llm_oracle::{LlmConfig, LlmOracle, LlmReply};
pub use oracle::{
    DecisionOracle, FallbackPolicy, GuardedOracle, OracleConfig, OracleContext, OracleError,
    OracleMode, RuleBasedConfig, RuleBasedOracle,
};
