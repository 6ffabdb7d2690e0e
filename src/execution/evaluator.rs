use serde::{Deserialize, Serialize};
use std::fmt;

use super::position_manager::OpenRequest;
use crate::levels::Tier;
use crate::models::{Direction, TradeSignal};
use crate::regime::TrendRegime;
use crate::risk::{profit_fee_ratio, size_position, SafetyStatus, SizingConfig, SizingRequest};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub fee_pct: f64,          // per-side fee, 0.001 = 0.1%
    pub max_daily_trades: u32,
    pub trend_filter: bool,
    /// Added to the tier threshold when the trend is bearish
    pub bearish_confidence_premium: f64,
    /// Size multiplier for shorts taken in a bearish trend
    pub bearish_size_factor: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            fee_pct: 0.001,
            max_daily_trades: 10,
            trend_filter: true,
            bearish_confidence_premium: 0.10,
            bearish_size_factor: 0.5,
        }
    }
}

/// Why a candidate did not become a trade
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NoSignal,
    InvalidSignal(String),
    Safety(SafetyStatus),
    LowConfidence { confidence: f64, threshold: f64 },
    LowProfitRatio { ratio: f64, minimum: f64 },
    DailyTradeLimit { count: u32, max: u32 },
    TrendFilter(String),
    InsufficientCapital,
}

impl RejectReason {
    /// Stable short code for logs and reports
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::NoSignal => "no_signal",
            RejectReason::InvalidSignal(_) => "invalid_signal",
            RejectReason::Safety(_) => "safety",
            RejectReason::LowConfidence { .. } => "low_confidence",
            RejectReason::LowProfitRatio { .. } => "low_profit_ratio",
            RejectReason::DailyTradeLimit { .. } => "daily_trade_limit",
            RejectReason::TrendFilter(_) => "trend_filter",
            RejectReason::InsufficientCapital => "insufficient_capital",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoSignal => write!(f, "hold signal"),
            RejectReason::InvalidSignal(why) => write!(f, "invalid signal: {}", why),
            RejectReason::Safety(status) => write!(f, "safety monitor: {:?}", status),
            RejectReason::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "confidence {:.2} below {:.2}", confidence, threshold),
            RejectReason::LowProfitRatio { ratio, minimum } => {
                write!(f, "profit/fee {:.1}x below {:.1}x", ratio, minimum)
            }
            RejectReason::DailyTradeLimit { count, max } => {
                write!(f, "daily trades {}/{}", count, max)
            }
            RejectReason::TrendFilter(why) => write!(f, "trend filter: {}", why),
            RejectReason::InsufficientCapital => write!(f, "capital too small for minimum position"),
        }
    }
}

/// Approved trade, sized and bracketed
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub pair: String,
    pub direction: Direction,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub profit_fee_ratio: f64,
    pub tier: String,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub reason: String,
}

impl Admission {
    pub fn open_request(&self) -> OpenRequest {
        OpenRequest {
            pair: self.pair.clone(),
            direction: self.direction,
            stop_loss_pct: self.stop_loss_pct,
            take_profit_pct: self.take_profit_pct,
            tier: self.tier.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Go(Admission),
    NoGo(RejectReason),
}

/// State the gates read, captured once per admission
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub tier: &'a Tier,
    pub safety: SafetyStatus,
    pub daily_trades: u32,
    pub capital: f64,
    pub entry_price: f64,
    pub trend: TrendRegime,
}

/// Gate pipeline from signal to GO / NO-GO; the first failing gate rejects
pub struct OpportunityEvaluator {
    config: EvaluatorConfig,
    sizing: SizingConfig,
}

impl OpportunityEvaluator {
    pub fn new(config: EvaluatorConfig, sizing: SizingConfig) -> Self {
        Self { config, sizing }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn sizing(&self) -> &SizingConfig {
        &self.sizing
    }

    pub fn evaluate(&self, signal: &TradeSignal, ctx: &EvaluationContext<'_>) -> Decision {
        let decision = self.decide(signal, ctx);

        match &decision {
            Decision::Go(admission) => tracing::info!(
                pair = %admission.pair,
                direction = ?admission.direction,
                size = admission.size,
                confidence = admission.confidence,
                tier = %admission.tier,
                "🟢 GO: {}",
                admission.reason
            ),
            Decision::NoGo(reason) => tracing::info!(
                pair = %signal.pair,
                code = reason.code(),
                "⏭️  NO-GO: {}",
                reason
            ),
        }

        decision
    }

    fn decide(&self, signal: &TradeSignal, ctx: &EvaluationContext<'_>) -> Decision {
        // Gate 1: safety
        if !ctx.safety.is_normal() {
            return Decision::NoGo(RejectReason::Safety(ctx.safety));
        }

        let direction = match signal.direction.as_direction() {
            Some(direction) => direction,
            None => return Decision::NoGo(RejectReason::NoSignal),
        };

        if !(0.0..=1.0).contains(&signal.confidence) {
            return Decision::NoGo(RejectReason::InvalidSignal(format!(
                "confidence {}",
                signal.confidence
            )));
        }
        if !signal.expected_profit_pct.is_finite() {
            return Decision::NoGo(RejectReason::InvalidSignal(format!(
                "expected profit {}",
                signal.expected_profit_pct
            )));
        }
        if !(ctx.entry_price.is_finite() && ctx.entry_price > 0.0) {
            return Decision::NoGo(RejectReason::InvalidSignal(format!(
                "entry price {}",
                ctx.entry_price
            )));
        }

        // Gate 2: confidence
        let tier = ctx.tier;
        if signal.confidence < tier.confidence_threshold {
            return Decision::NoGo(RejectReason::LowConfidence {
                confidence: signal.confidence,
                threshold: tier.confidence_threshold,
            });
        }

        // Gate 3: profit must dwarf fees
        let ratio = profit_fee_ratio(signal.expected_profit_pct, self.config.fee_pct);
        if ratio < tier.min_profit_fee_ratio {
            return Decision::NoGo(RejectReason::LowProfitRatio {
                ratio,
                minimum: tier.min_profit_fee_ratio,
            });
        }

        // Gate 4: daily trade budget
        if ctx.daily_trades >= self.config.max_daily_trades {
            return Decision::NoGo(RejectReason::DailyTradeLimit {
                count: ctx.daily_trades,
                max: self.config.max_daily_trades,
            });
        }

        // Gate 5: trend filter
        let bearish = self.config.trend_filter && ctx.trend == TrendRegime::Bearish;
        if bearish {
            if direction == Direction::Long {
                return Decision::NoGo(RejectReason::TrendFilter(
                    "no longs in a bearish trend".to_string(),
                ));
            }

            let elevated = tier.confidence_threshold + self.config.bearish_confidence_premium;
            if signal.confidence < elevated {
                return Decision::NoGo(RejectReason::TrendFilter(format!(
                    "bearish trend needs confidence {:.2}, got {:.2}",
                    elevated, signal.confidence
                )));
            }
        }

        let request = SizingRequest {
            capital: ctx.capital,
            confidence: signal.confidence,
            expected_profit_pct: signal.expected_profit_pct,
            fee_pct: self.config.fee_pct,
            entry_price: ctx.entry_price,
            direction,
        };

        let plan = match size_position(&self.sizing, tier, &request) {
            Some(plan) => plan,
            None => return Decision::NoGo(RejectReason::InsufficientCapital),
        };

        let size = if bearish {
            (plan.size * self.config.bearish_size_factor).max(self.sizing.min_position)
        } else {
            plan.size
        };

        Decision::Go(Admission {
            pair: signal.pair.clone(),
            direction,
            size,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            confidence: signal.confidence,
            profit_fee_ratio: ratio,
            tier: tier.name.clone(),
            stop_loss_pct: tier.stop_loss_pct,
            take_profit_pct: tier.take_profit_pct,
            reason: format!(
                "{:?} @ {:.0}% confidence, profit/fee {:.0}x{}",
                direction,
                signal.confidence * 100.0,
                ratio,
                if bearish { ", bearish size cut" } else { "" }
            ),
        })
    }
}
