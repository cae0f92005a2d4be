//! Signal evaluation and cooldown.

mod cooldown;
mod evaluator;
mod event;

pub use cooldown::{CooldownGate, GateState};
pub use evaluator::{
    EvaluatorConfig, FilterReport, MomentumCheck, PriceShock, ShockUnavailable, SignalEvaluator,
};
pub use event::{Direction, SignalEvent};
