//! Incremental relative-strength oscillator.
//!
//! Wilder smoothing of average gain and loss. The first `period` price
//! changes are averaged arithmetically to seed the accumulators, so the
//! first value appears after `period + 1` closed candles. Each later candle
//! costs O(1):
//!
//! ```text
//! avg = (avg_prev * (period - 1) + current) / period
//! rsi = 100 - 100 / (1 + avg_gain / avg_loss)
//! ```

use super::types::{Candle, Timeframe};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

const HUNDRED: Decimal = dec!(100);

/// Oscillator state for one (instrument, timeframe).
#[derive(Debug, Clone)]
pub struct MomentumState {
    timeframe: Timeframe,
    period: u32,
    prev_close: Option<Decimal>,
    last_bucket: Option<DateTime<Utc>>,
    /// Number of price changes folded in so far
    changes: u32,
    avg_gain: Decimal,
    avg_loss: Decimal,
    value: Option<Decimal>,
}

impl MomentumState {
    pub fn new(timeframe: Timeframe, period: u32) -> Self {
        Self {
            timeframe,
            period: period.max(1),
            prev_close: None,
            last_bucket: None,
            changes: 0,
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            value: None,
        }
    }

    /// Apply a newly closed candle. Candles not newer than the last applied
    /// bucket are ignored.
    pub fn update(&mut self, candle: &Candle) -> Option<Decimal> {
        if self.last_bucket.is_some_and(|last| candle.bucket_start <= last) {
            debug!(
                symbol = %candle.symbol,
                timeframe = %self.timeframe,
                bucket = %candle.bucket_start,
                "Ignoring out-of-order candle for momentum"
            );
            return self.value;
        }
        self.last_bucket = Some(candle.bucket_start);

        let Some(prev) = self.prev_close.replace(candle.close) else {
            return None;
        };

        let change = candle.close - prev;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        let period = Decimal::from(self.period);

        if self.changes < self.period {
            // Seed phase: running arithmetic mean
            self.avg_gain += gain;
            self.avg_loss += loss;
            self.changes += 1;
            if self.changes < self.period {
                return None;
            }
            self.avg_gain /= period;
            self.avg_loss /= period;
        } else {
            let keep = period - Decimal::ONE;
            self.avg_gain = (self.avg_gain * keep + gain) / period;
            self.avg_loss = (self.avg_loss * keep + loss) / period;
        }

        let value = oscillator(self.avg_gain, self.avg_loss);
        self.value = Some(value);
        self.value
    }

    /// Current oscillator value, `None` until enough candles were applied.
    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    /// Closed candles still required before a value is defined.
    pub fn candles_needed(&self) -> u32 {
        if self.is_ready() {
            return 0;
        }
        let applied = self.changes + u32::from(self.prev_close.is_some());
        (self.period + 1).saturating_sub(applied)
    }

    pub fn last_bucket(&self) -> Option<DateTime<Utc>> {
        self.last_bucket
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }
}

fn oscillator(avg_gain: Decimal, avg_loss: Decimal) -> Decimal {
    // No gains reads as 0 even when there are no losses either
    let value = match (avg_gain.is_zero(), avg_loss.is_zero()) {
        (true, _) => Decimal::ZERO,
        (false, true) => HUNDRED,
        _ => HUNDRED - HUNDRED / (Decimal::ONE + avg_gain / avg_loss),
    };
    value.clamp(Decimal::ZERO, HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn candles(timeframe: Timeframe, closes: &[Decimal]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                symbol: "SOL_USDT".to_string(),
                timeframe,
                bucket_start: base + timeframe.duration() * i as i32,
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: Decimal::ONE,
                closed: true,
            })
            .collect()
    }

    fn closes_from_changes(start: Decimal, changes: &[Decimal]) -> Vec<Decimal> {
        let mut closes = vec![start];
        for change in changes {
            let last = *closes.last().unwrap();
            closes.push(last + change);
        }
        closes
    }

    #[test]
    fn test_requires_period_plus_one_candles() {
        let closes = closes_from_changes(dec!(100), &[dec!(1); 14]);
        let series = candles(Timeframe::Min15, &closes);
        let mut state = MomentumState::new(Timeframe::Min15, 14);

        for candle in &series[..14] {
            assert_eq!(state.update(candle), None);
        }
        assert_eq!(state.candles_needed(), 1);
        assert_eq!(state.update(&series[14]), Some(dec!(100)));
        assert_eq!(state.candles_needed(), 0);
    }

    #[test]
    fn test_seed_value_matches_gain_loss_ratio() {
        // 7 gains of 3 and 7 losses of 1 -> RS = 3 -> RSI = 75
        let mut changes = Vec::new();
        for _ in 0..7 {
            changes.push(dec!(3));
            changes.push(dec!(-1));
        }
        let closes = closes_from_changes(dec!(100), &changes);
        let mut state = MomentumState::new(Timeframe::Min15, 14);
        let mut last = None;
        for candle in candles(Timeframe::Min15, &closes) {
            last = state.update(&candle);
        }
        assert_eq!(last, Some(dec!(75)));
    }

    #[test]
    fn test_wilder_smoothing_step() {
        // Seed averages 1/1 (RSI 50), then one gain of 2 with period 2:
        // avg_gain = (1 * 1 + 2) / 2 = 1.5, avg_loss = (1 * 1 + 0) / 2 = 0.5
        let closes = [dec!(10), dec!(12), dec!(10), dec!(12)];
        let mut state = MomentumState::new(Timeframe::Hour1, 2);
        let values: Vec<_> = candles(Timeframe::Hour1, &closes)
            .iter()
            .map(|c| state.update(c))
            .collect();
        assert_eq!(values, vec![None, None, Some(dec!(50)), Some(dec!(75))]);
    }

    #[test]
    fn test_one_sided_moves() {
        let falling = closes_from_changes(dec!(100), &[dec!(-1); 3]);
        let mut state = MomentumState::new(Timeframe::Min15, 3);
        for candle in candles(Timeframe::Min15, &falling) {
            state.update(&candle);
        }
        assert_eq!(state.value(), Some(Decimal::ZERO));

        let rising = closes_from_changes(dec!(100), &[dec!(2); 3]);
        let mut state = MomentumState::new(Timeframe::Min15, 3);
        for candle in candles(Timeframe::Min15, &rising) {
            state.update(&candle);
        }
        assert_eq!(state.value(), Some(dec!(100)));
    }

    #[test]
    fn test_flat_market_reads_zero() {
        let flat = [dec!(5); 15];
        let mut state = MomentumState::new(Timeframe::Hour1, 14);
        for candle in candles(Timeframe::Hour1, &flat) {
            state.update(&candle);
        }
        assert_eq!(state.value(), Some(Decimal::ZERO));

        // A single gain after a flat run moves straight to 100
        let mut closes = vec![dec!(5); 15];
        closes.push(dec!(6));
        let mut state = MomentumState::new(Timeframe::Hour1, 14);
        let last = candles(Timeframe::Hour1, &closes)
            .iter()
            .map(|c| state.update(c))
            .last()
            .flatten();
        assert_eq!(last, Some(dec!(100)));
    }

    #[test]
    fn test_out_of_order_candle_ignored() {
        let series = candles(Timeframe::Min15, &[dec!(1), dec!(2), dec!(3)]);
        let mut state = MomentumState::new(Timeframe::Min15, 2);
        state.update(&series[0]);
        state.update(&series[2]);
        let before = state.clone();
        state.update(&series[1]);
        assert_eq!(state.last_bucket(), before.last_bucket());
        assert_eq!(state.candles_needed(), before.candles_needed());
    }

    fn price_changes() -> impl Strategy<Value = Vec<Decimal>> {
        proptest::collection::vec(-500i64..500, 0..120)
            .prop_map(|cents| cents.into_iter().map(|c| Decimal::new(c, 2)).collect())
    }

    proptest! {
        #[test]
        fn prop_oscillator_bounded(period in 2u32..30, changes in price_changes()) {
            let closes = closes_from_changes(dec!(1000), &changes);
            let mut state = MomentumState::new(Timeframe::Min15, period);
            for candle in candles(Timeframe::Min15, &closes) {
                if let Some(value) = state.update(&candle) {
                    prop_assert!(value >= Decimal::ZERO && value <= dec!(100));
                }
            }
        }
    }
}
