//! Rounding & rules cache — pure decimal-grid functions plus a small
//! registry of [`InstrumentRules`] shared read-only across the core after
//! load, replaced only by a recalibration pass.

use std::collections::HashMap;
use std::sync::Arc;

use common::InstrumentRules;
use rust_decimal::Decimal;

/// Round `value` down to the nearest multiple of `step`.
/// Idempotent: `round_qty_down(round_qty_down(x, s), s) == round_qty_down(x, s)`.
pub fn round_qty_down(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

/// Round `value` up to the nearest multiple of `step`.
pub fn round_qty_up(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).ceil() * step
}

/// Which direction is "safe" for a price rounded onto the tick grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDirection {
    Up,
    Down,
}

/// Round `price` onto the `tick` grid in the given, conservative direction.
/// Idempotent on-grid: an already-aligned price is returned unchanged.
pub fn round_price(price: Decimal, tick: Decimal, direction: RoundDirection) -> Decimal {
    match direction {
        RoundDirection::Down => round_qty_down(price, tick),
        RoundDirection::Up => round_qty_up(price, tick),
    }
}

/// Whether `qty * price` clears `min_notional`.
pub fn meets_min_notional(qty: Decimal, price: Decimal, min_notional: Decimal) -> bool {
    qty * price >= min_notional
}

/// Registry of per-symbol instrument rules. Read-heavy: lookups clone an
/// `Arc`, never the underlying rules. Replaced wholesale by recalibration
/// when a symbol's grid changes; `leverage` alone can be updated in place
/// via `InstrumentRules::set_leverage`.
#[derive(Default)]
pub struct RulesCache {
    rules: HashMap<String, Arc<InstrumentRules>>,
}

impl RulesCache {
    pub fn new() -> Self {
        Self { rules: HashMap::new() }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<InstrumentRules>> {
        self.rules.get(symbol).cloned()
    }

    pub fn insert(&mut self, rules: InstrumentRules) {
        self.rules.insert(rules.symbol.clone(), Arc::new(rules));
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_down_is_idempotent() {
        let x = dec!(1.23456);
        let step = dec!(0.001);
        let once = round_qty_down(x, step);
        let twice = round_qty_down(once, step);
        assert_eq!(once, twice);
        assert_eq!(once, dec!(1.234));
    }

    #[test]
    fn round_up_rounds_away_from_zero_on_remainder() {
        assert_eq!(round_qty_up(dec!(1.2301), dec!(0.01)), dec!(1.24));
        // Already on-grid: unchanged.
        assert_eq!(round_qty_up(dec!(1.23), dec!(0.01)), dec!(1.23));
    }

    #[test]
    fn price_rounding_toward_safe_is_idempotent_on_grid() {
        let tick = dec!(0.01);
        let p = round_price(dec!(151.5152), tick, RoundDirection::Up);
        assert_eq!(p, dec!(151.52));
        assert_eq!(round_price(p, tick, RoundDirection::Up), p);
    }

    #[test]
    fn min_notional_check() {
        assert!(meets_min_notional(dec!(0.01), dec!(500), dec!(5)));
        assert!(!meets_min_notional(dec!(0.001), dec!(200), dec!(5)));
    }

    proptest::proptest! {
        #[test]
        fn round_down_never_exceeds_input(raw in 0i64..1_000_000_000i64, step_raw in 1i64..100_000i64) {
            let value = Decimal::new(raw, 3);
            let step = Decimal::new(step_raw, 3);
            let rounded = round_qty_down(value, step);
            prop_assert!(rounded <= value);
            // idempotence
            prop_assert_eq!(round_qty_down(rounded, step), rounded);
        }
    }
}
