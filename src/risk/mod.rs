// Risk management module
pub mod circuit_breakers;
pub mod sizer;

pub use circuit_breakers::{
    CircuitBreakerTrip, CircuitBreakers, SafetyMonitor, SafetyState, SafetyStatus,
};
pub use sizer::{profit_fee_ratio, size_position, PositionPlan, SizingConfig, SizingRequest};
