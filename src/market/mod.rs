//! Market state: candle types, rolling windows and the momentum oscillator.

mod momentum;
mod types;
mod window;

pub use momentum::MomentumState;
pub use types::{Candle, Instrument, Tick, Timeframe};
pub use window::{RecordOutcome, RollingWindow, WindowStore};
