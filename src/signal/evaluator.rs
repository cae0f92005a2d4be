//! Three-filter trigger condition.
//!
//! A signal requires, for the same instrument at the same instant:
//!
//! 1. a price shock over the last `price_check_period` closed 1m candles,
//! 2. an extreme long-horizon (1h) momentum reading,
//! 3. an extreme short-horizon (15m) momentum reading on the same side.
//!
//! The evaluator is a pure function of the window store and the two
//! momentum values; it owns no state and never fires by itself.

use super::event::{Direction, SignalEvent};
use crate::market::{Timeframe, WindowStore};
use crate::utils::percent_change;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Evaluation thresholds, taken from the validated monitor config.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorConfig {
    /// Absolute percent move required over the window
    pub price_change_threshold: Decimal,
    /// Number of closed 1m candles in the price-shock window
    pub price_check_period: usize,
    pub overbought: Decimal,
    pub oversold: Decimal,
}

/// Outcome of the price-shock filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceShock {
    /// Close of the oldest candle in the window
    pub reference: Decimal,
    pub last_price: Decimal,
    /// Signed change in percent
    pub change_pct: Decimal,
    pub passed: bool,
}

/// Why the price-shock filter could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShockUnavailable {
    InsufficientCandles { have: usize, need: usize },
    GapInWindow,
    NonPositiveReference,
}

/// Outcome of one momentum filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MomentumCheck {
    pub value: Option<Decimal>,
    pub zone: Option<Direction>,
}

impl MomentumCheck {
    pub fn passed(&self) -> bool {
        self.zone.is_some()
    }
}

/// Every filter's value and verdict for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterReport {
    pub symbol: String,
    pub evaluated_at: DateTime<Utc>,
    pub price_shock: Result<PriceShock, ShockUnavailable>,
    pub momentum_1h: MomentumCheck,
    pub momentum_15m: MomentumCheck,
}

impl FilterReport {
    pub fn price_shock_passed(&self) -> bool {
        self.price_shock.as_ref().is_ok_and(|shock| shock.passed)
    }

    /// Common side of both momentum readings, if they agree.
    pub fn direction(&self) -> Option<Direction> {
        match (self.momentum_1h.zone, self.momentum_15m.zone) {
            (Some(long), Some(short)) if long == short => Some(long),
            _ => None,
        }
    }

    /// All three filters hold and momentum agrees on direction.
    pub fn triggered(&self) -> bool {
        self.price_shock_passed() && self.direction().is_some()
    }

    /// Build the signal event if the report triggered.
    pub fn to_event(&self) -> Option<SignalEvent> {
        let direction = self.direction()?;
        let shock = self.price_shock.as_ref().ok().filter(|s| s.passed)?;
        Some(SignalEvent {
            symbol: self.symbol.clone(),
            triggered_at: self.evaluated_at,
            price_change_pct: shock.change_pct,
            last_price: shock.last_price,
            momentum_1h: self.momentum_1h.value?,
            momentum_15m: self.momentum_15m.value?,
            direction,
        })
    }
}

/// Applies the three filters to one instrument's state.
#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    config: EvaluatorConfig,
}

impl SignalEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn evaluate(
        &self,
        symbol: &str,
        store: &WindowStore,
        momentum_1h: Option<Decimal>,
        momentum_15m: Option<Decimal>,
        evaluated_at: DateTime<Utc>,
    ) -> FilterReport {
        FilterReport {
            symbol: symbol.to_string(),
            evaluated_at,
            price_shock: self.price_shock(store),
            momentum_1h: self.momentum_check(momentum_1h),
            momentum_15m: self.momentum_check(momentum_15m),
        }
    }

    fn price_shock(&self, store: &WindowStore) -> Result<PriceShock, ShockUnavailable> {
        let need = self.config.price_check_period;
        let candles = store.closed(Timeframe::SHORTEST, need);
        if candles.len() < need || need == 0 {
            return Err(ShockUnavailable::InsufficientCandles {
                have: candles.len(),
                need,
            });
        }

        let step = Timeframe::SHORTEST.duration();
        if candles
            .windows(2)
            .any(|pair| pair[1].bucket_start - pair[0].bucket_start != step)
        {
            return Err(ShockUnavailable::GapInWindow);
        }

        let reference = candles[0].close;
        let last_price = store
            .last_price(Timeframe::SHORTEST)
            .unwrap_or(candles[need - 1].close);
        let change_pct =
            percent_change(reference, last_price).ok_or(ShockUnavailable::NonPositiveReference)?;

        Ok(PriceShock {
            reference,
            last_price,
            change_pct,
            passed: change_pct.abs() >= self.config.price_change_threshold,
        })
    }

    fn momentum_check(&self, value: Option<Decimal>) -> MomentumCheck {
        let zone = value.and_then(|v| {
            if v > self.config.overbought {
                Some(Direction::Overbought)
            } else if v < self.config.oversold {
                Some(Direction::Oversold)
            } else {
                None
            }
        });
        MomentumCheck { value, zone }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Candle;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn evaluator() -> SignalEvaluator {
        SignalEvaluator::new(EvaluatorConfig {
            price_change_threshold: dec!(8),
            price_check_period: 15,
            overbought: dec!(70),
            oversold: dec!(30),
        })
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn minute(m: i64, close: Decimal) -> Candle {
        Candle {
            symbol: "XRP_USDT".to_string(),
            timeframe: Timeframe::Min1,
            bucket_start: base() + Duration::minutes(m),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(10),
            closed: true,
        }
    }

    /// 15 one-minute candles moving linearly from `first` to `last`.
    fn store_with_move(first: Decimal, last: Decimal) -> WindowStore {
        let mut store = WindowStore::new(100);
        let step = (last - first) / dec!(14);
        for m in 0..14 {
            store.record(minute(m, first + step * Decimal::from(m)));
        }
        store.record(minute(14, last));
        store
    }

    #[test]
    fn test_all_filters_pass_overbought() {
        let store = store_with_move(dec!(100), dec!(108.5));
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(78)), Some(dec!(75)), base());

        assert!(report.price_shock_passed());
        assert_eq!(report.direction(), Some(Direction::Overbought));
        let event = report.to_event().unwrap();
        assert_eq!(event.price_change_pct, dec!(8.5));
        assert_eq!(event.last_price, dec!(108.5));
        assert_eq!(event.momentum_1h, dec!(78));
        assert_eq!(event.momentum_15m, dec!(75));
    }

    #[test]
    fn test_price_drop_oversold() {
        let store = store_with_move(dec!(50), dec!(45));
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(21)), Some(dec!(12)), base());
        let event = report.to_event().unwrap();
        assert_eq!(event.direction, Direction::Oversold);
        assert_eq!(event.price_change_pct, dec!(-10));
    }

    #[test]
    fn test_neutral_long_horizon_blocks() {
        let store = store_with_move(dec!(100), dec!(108.5));
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(55)), Some(dec!(75)), base());
        assert!(report.price_shock_passed());
        assert!(!report.momentum_1h.passed());
        assert!(!report.triggered());
        assert!(report.to_event().is_none());
    }

    #[test]
    fn test_mixed_directions_do_not_trigger() {
        let store = store_with_move(dec!(100), dec!(110));
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(80)), Some(dec!(20)), base());
        assert!(report.momentum_1h.passed() && report.momentum_15m.passed());
        assert_eq!(report.direction(), None);
        assert!(!report.triggered());
    }

    #[test]
    fn test_thresholds_are_strict_for_momentum_inclusive_for_price() {
        let store = store_with_move(dec!(100), dec!(108));
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(70)), Some(dec!(75)), base());
        assert!(report.price_shock_passed());
        assert!(!report.momentum_1h.passed());

        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(30)), Some(dec!(29.99)), base());
        assert!(!report.momentum_1h.passed());
        assert_eq!(report.momentum_15m.zone, Some(Direction::Oversold));
    }

    #[test]
    fn test_insufficient_candles() {
        let mut store = WindowStore::new(100);
        for m in 0..14 {
            store.record(minute(m, dec!(100)));
        }
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(90)), Some(dec!(90)), base());
        assert_eq!(
            report.price_shock,
            Err(ShockUnavailable::InsufficientCandles { have: 14, need: 15 })
        );
        assert!(!report.triggered());
    }

    #[test]
    fn test_gap_in_window() {
        let mut store = WindowStore::new(100);
        for m in (0..16).filter(|m| *m != 7) {
            store.record(minute(m, dec!(100) + Decimal::from(m)));
        }
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(90)), Some(dec!(90)), base());
        assert_eq!(report.price_shock, Err(ShockUnavailable::GapInWindow));
    }

    #[test]
    fn test_non_positive_reference() {
        let mut store = WindowStore::new(100);
        for m in 0..15 {
            store.record(minute(m, if m == 0 { Decimal::ZERO } else { dec!(1) }));
        }
        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(90)), Some(dec!(90)), base());
        assert_eq!(report.price_shock, Err(ShockUnavailable::NonPositiveReference));
    }

    #[test]
    fn test_open_bucket_price_is_used() {
        let mut store = store_with_move(dec!(100), dec!(104));
        let tick = crate::market::Tick {
            symbol: "XRP_USDT".to_string(),
            timestamp: base() + Duration::seconds(15 * 60 + 20),
            price: dec!(109),
            volume: dec!(1),
        };
        store.record_tick(&tick);

        let report = evaluator().evaluate("XRP_USDT", &store, Some(dec!(90)), Some(dec!(90)), base());
        let shock = report.price_shock.clone().unwrap();
        assert_eq!(shock.last_price, dec!(109));
        assert_eq!(shock.change_pct, dec!(9));
        assert!(report.triggered());
    }

    #[test]
    fn test_undefined_momentum_never_passes() {
        let store = store_with_move(dec!(100), dec!(120));
        let report = evaluator().evaluate("XRP_USDT", &store, None, Some(dec!(90)), base());
        assert!(!report.triggered());
        assert!(report.to_event().is_none());
    }
}
