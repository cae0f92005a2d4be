//! Market data types shared by the feed, the window store and the evaluator.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tradable futures contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Contract symbol, e.g. `BTC_USDT`
    pub symbol: String,
    /// Whether the contract is currently tradable
    pub active: bool,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            active: true,
        }
    }
}

/// Candle bucket duration tracked by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// Price-shock horizon; closes of this timeframe drive evaluation.
    Min1,
    /// Short momentum horizon.
    Min15,
    /// Long momentum horizon.
    Hour1,
}

impl Timeframe {
    /// Every tracked timeframe, shortest first.
    pub const ALL: [Timeframe; 3] = [Timeframe::Min1, Timeframe::Min15, Timeframe::Hour1];

    /// The timeframe whose closed candles trigger evaluation.
    pub const SHORTEST: Timeframe = Timeframe::Min1;

    pub fn seconds(self) -> i64 {
        match self {
            Timeframe::Min1 => 60,
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Position in [`Timeframe::ALL`].
    pub fn index(self) -> usize {
        match self {
            Timeframe::Min1 => 0,
            Timeframe::Min15 => 1,
            Timeframe::Hour1 => 2,
        }
    }

    /// Start of the epoch-aligned bucket containing `ts`.
    pub fn bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.seconds();
        let aligned = ts.timestamp().div_euclid(step) * step;
        DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-trade update for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    /// Volume traded since the previous tick of the same session
    pub volume: Decimal,
}

/// OHLCV bucket for one instrument and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// True once the bucket's time range has elapsed
    pub closed: bool,
}

impl Candle {
    /// Open a new bucket from a single trade.
    pub fn from_tick(tick: &Tick, timeframe: Timeframe) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            timeframe,
            bucket_start: timeframe.bucket_start(tick.timestamp),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            closed: false,
        }
    }

    /// End of the bucket (exclusive).
    pub fn close_time(&self) -> DateTime<Utc> {
        self.bucket_start + self.timeframe.duration()
    }

    /// Fold a trade into the running high/low/close/volume.
    pub fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
    }
}
