//! Fixed-capacity rolling candle windows.
//!
//! One [`RollingWindow`] per timeframe holds the most recent closed candles
//! in bucket order plus the bucket currently being built from ticks. A
//! [`WindowStore`] groups the windows of a single instrument.

use super::types::{Candle, Tick, Timeframe};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Result of inserting a closed candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// Bucket already retained; nothing changed
    Duplicate,
    /// Bucket older than the oldest retained one; dropped
    Stale,
    /// Candle was not marked closed; dropped
    NotClosed,
}

/// Ring of closed candles for one (instrument, timeframe).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    timeframe: Timeframe,
    capacity: usize,
    candles: VecDeque<Candle>,
    open: Option<Candle>,
}

impl RollingWindow {
    pub fn new(timeframe: Timeframe, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            timeframe,
            capacity,
            candles: VecDeque::with_capacity(capacity + 1),
            open: None,
        }
    }

    /// Insert a closed candle in bucket order, evicting the oldest on overflow.
    pub fn record(&mut self, candle: Candle) -> RecordOutcome {
        if !candle.closed {
            return RecordOutcome::NotClosed;
        }

        if let Some(oldest) = self.candles.front() {
            if candle.bucket_start < oldest.bucket_start {
                debug!(
                    symbol = %candle.symbol,
                    timeframe = %self.timeframe,
                    bucket = %candle.bucket_start,
                    "Dropping stale candle"
                );
                return RecordOutcome::Stale;
            }
        }

        let position = self
            .candles
            .binary_search_by(|c| c.bucket_start.cmp(&candle.bucket_start));
        let index = match position {
            Ok(_) => {
                trace!(symbol = %candle.symbol, bucket = %candle.bucket_start, "Duplicate candle");
                return RecordOutcome::Duplicate;
            }
            Err(index) => index,
        };

        if self
            .open
            .as_ref()
            .is_some_and(|open| open.bucket_start <= candle.bucket_start)
        {
            self.open = None;
        }

        self.candles.insert(index, candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }

        RecordOutcome::Inserted
    }

    /// Fold a tick into the open bucket. Returns false if the tick was dropped.
    pub fn record_tick(&mut self, tick: &Tick) -> bool {
        let bucket = self.timeframe.bucket_start(tick.timestamp);

        if self.candles.back().is_some_and(|c| c.bucket_start >= bucket) {
            return false;
        }

        match self.open.as_mut() {
            Some(open) if open.bucket_start == bucket => {
                open.absorb(tick);
                true
            }
            Some(open) if open.bucket_start > bucket => false,
            _ => {
                self.open = Some(Candle::from_tick(tick, self.timeframe));
                true
            }
        }
    }

    /// The last `k` closed candles, oldest first.
    pub fn closed(&self, k: usize) -> Vec<&Candle> {
        let skip = self.candles.len().saturating_sub(k);
        self.candles.iter().skip(skip).collect()
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn open(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// All rolling windows of one instrument.
#[derive(Debug, Clone)]
pub struct WindowStore {
    windows: [RollingWindow; 3],
    last_update: Option<DateTime<Utc>>,
}

impl WindowStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: Timeframe::ALL.map(|tf| RollingWindow::new(tf, capacity)),
            last_update: None,
        }
    }

    pub fn record(&mut self, candle: Candle) -> RecordOutcome {
        let close_time = candle.close_time();
        let outcome = self.windows[candle.timeframe.index()].record(candle);
        if outcome == RecordOutcome::Inserted {
            self.touch(close_time);
        }
        outcome
    }

    /// Update the open bucket of every timeframe without closing it.
    pub fn record_tick(&mut self, tick: &Tick) -> bool {
        let mut accepted = false;
        for window in &mut self.windows {
            accepted |= window.record_tick(tick);
        }
        if accepted {
            self.touch(tick.timestamp);
        }
        accepted
    }

    pub fn window(&self, timeframe: Timeframe) -> &RollingWindow {
        &self.windows[timeframe.index()]
    }

    pub fn closed(&self, timeframe: Timeframe, k: usize) -> Vec<&Candle> {
        self.window(timeframe).closed(k)
    }

    /// Most recent price seen: open-bucket close if newer, else last close.
    pub fn last_price(&self, timeframe: Timeframe) -> Option<rust_decimal::Decimal> {
        let window = self.window(timeframe);
        window
            .open()
            .or_else(|| window.latest())
            .map(|candle| candle.close)
    }

    /// Timestamp of the newest accepted data point.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    fn touch(&mut self, ts: DateTime<Utc>) {
        if self.last_update.map_or(true, |last| ts > last) {
            self.last_update = Some(ts);
        }
    }
}
