//! Decimal arithmetic helpers for price comparisons.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Signed percentage change from `from` to `to`.
///
/// Returns `None` when the reference price is not positive.
pub fn percent_change(from: Decimal, to: Decimal) -> Option<Decimal> {
    if from <= Decimal::ZERO {
        return None;
    }
    Some((to - from) / from * dec!(100))
}

/// Round half away from zero for display, keeping at most `decimals` places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value
        .round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(dec!(100), dec!(108.5)), Some(dec!(8.5)));
        assert_eq!(percent_change(dec!(200), dec!(180)), Some(dec!(-10)));
        assert_eq!(percent_change(Decimal::ZERO, dec!(1)), None);
        assert_eq!(percent_change(dec!(-1), dec!(1)), None);
    }

    #[test]
    fn test_round_to_precision() {
        assert_eq!(round_to_precision(dec!(75.123456), 2), dec!(75.12));
        assert_eq!(round_to_precision(dec!(0.000012345), 8), dec!(0.00001235));
        assert_eq!(round_to_precision(dec!(8.50), 2).to_string(), "8.5");
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_to_precision(dec!(72.125), 2), dec!(72.13));
        assert_eq!(round_to_precision(dec!(-8.125), 2), dec!(-8.13));
        assert_eq!(round_to_precision(dec!(0.5), 0), dec!(1));
    }
}
