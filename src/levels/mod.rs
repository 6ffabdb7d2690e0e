// Risk tier ladder module
pub mod manager;
pub mod performance;
pub mod tier;

pub use manager::{
    DowngradeTrigger, LevelInputs, LevelManager, LevelRules, TierTransition, UpgradeTrigger,
};
pub use performance::{CapitalPoint, PerformanceWindow, TradeOutcome};
pub use tier::{default_tiers, protective_prices, Tier};
