// Admission and position lifecycle module
pub mod evaluator;
pub mod ledger;
pub mod position_manager;

pub use evaluator::{
    Admission, Decision, EvaluationContext, EvaluatorConfig, OpportunityEvaluator, RejectReason,
};
pub use ledger::{CapitalLedger, LedgerError, LedgerSnapshot, Reservation};
pub use position_manager::{
    ExitReason, ExitSignal, ExitSweep, LifecycleConfig, OpenRequest, Position, PositionError,
    PositionManager, PositionStatus, TrailingStop,
};
