//! Shared utilities.

pub mod decimal;

pub use decimal::{percent_change, round_to_precision};
