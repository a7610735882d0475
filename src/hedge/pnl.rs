// =============================================================================
// PnL Calculator — pure profit functions for one leg
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::types::Side;

/// Unrealized profit in percent of entry price.
///
/// Returns `None` when `entry_price <= 0` (undefined percentage).
pub fn profit_pct(side: Side, entry_price: Decimal, mark_price: Decimal) -> Option<f64> {
    if entry_price <= Decimal::ZERO {
        return None;
    }
    let diff = match side {
        Side::Long => mark_price - entry_price,
        Side::Short => entry_price - mark_price,
    };
    (diff / entry_price * Decimal::ONE_HUNDRED).to_f64()
}

/// Realized profit in quote currency for closing `amount` at `close_price`.
pub fn profit_usdt(side: Side, entry_price: Decimal, close_price: Decimal, amount: Decimal) -> Decimal {
    match side {
        Side::Long => (close_price - entry_price) * amount,
        Side::Short => (entry_price - close_price) * amount,
    }
}

/// Realized profit as a percent of the leg's notional at entry.
pub fn realized_pct(profit_usdt: Decimal, entry_price: Decimal, amount: Decimal) -> f64 {
    let notional = entry_price * amount;
    if notional.is_zero() {
        return 0.0;
    }
    (profit_usdt / notional * Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn long_and_short_mirror_each_other() {
        assert_eq!(profit_pct(Side::Long, dec!(100), dec!(98)), Some(-2.0));
        assert_eq!(profit_pct(Side::Short, dec!(100), dec!(98)), Some(2.0));
        assert_eq!(profit_pct(Side::Long, dec!(200), dec!(201)), Some(0.5));
    }

    #[test]
    fn percentage_undefined_without_entry() {
        assert_eq!(profit_pct(Side::Long, Decimal::ZERO, dec!(10)), None);
        assert_eq!(profit_pct(Side::Short, dec!(-1), dec!(10)), None);
    }

    #[test]
    fn realized_usdt_uses_price_difference() {
        assert_eq!(profit_usdt(Side::Long, dec!(100), dec!(98), dec!(1)), dec!(-2));
        assert_eq!(profit_usdt(Side::Short, dec!(100), dec!(98), dec!(1.5)), dec!(3.0));
    }

    #[test]
    fn realized_pct_is_relative_to_entry_notional() {
        assert_eq!(realized_pct(dec!(-2), dec!(100), dec!(1)), -2.0);
        assert_eq!(realized_pct(dec!(5), Decimal::ZERO, dec!(1)), 0.0);
    }
}
