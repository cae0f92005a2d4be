//! The unit of output handed to alert sinks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the momentum extreme shared by both horizons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Overbought,
    Oversold,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Overbought => "overbought",
            Direction::Oversold => "oversold",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A qualifying price shock with confirming momentum on both horizons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub symbol: String,
    pub triggered_at: DateTime<Utc>,
    /// Signed change over the price-shock window, in percent
    pub price_change_pct: Decimal,
    /// Price the change was measured to
    pub last_price: Decimal,
    pub momentum_1h: Decimal,
    pub momentum_15m: Decimal,
    pub direction: Direction,
}
