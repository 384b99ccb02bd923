//! Quantity composition and the no-dust completion rule. Both are pure
//! functions over decimals — no engine state — so the arithmetic can be
//! checked in isolation from the state machine.

use common::InstrumentRules;
use rounding::round_qty_down;
use rust_decimal::Decimal;

/// A side is done — the engine stops acting on it — once the remaining
/// position can no longer be traded: either it's already on the zero grid,
/// or it's sub-`min_qty` and even selling the whole remainder wouldn't clear
/// `min_notional`.
pub fn is_side_done(position_amt_abs: Decimal, rules: &InstrumentRules, last_trade_price: Decimal) -> bool {
    if round_qty_down(position_amt_abs, rules.step_size).is_zero() {
        return true;
    }
    if position_amt_abs < rules.min_qty && position_amt_abs * last_trade_price < rules.min_notional {
        return true;
    }
    false
}

/// Compose the reduce-only order quantity for a normal (non-panic) signal.
/// Returns `None` if, after composition, nothing tradeable remains — the
/// caller should treat that as completion, not as "try again later".
///
/// `raw_mult = base_lot_mult * roi_mult * accel_mult`, capped at `max_mult`,
/// is computed by the caller (it needs config fields this module doesn't
/// otherwise need) and passed in already capped.
pub fn compose_quantity(
    position_amt_abs: Decimal,
    rules: &InstrumentRules,
    last_trade_price: Decimal,
    raw_mult: Decimal,
    max_order_notional: Decimal,
) -> Option<Decimal> {
    if is_side_done(position_amt_abs, rules, last_trade_price) {
        return None;
    }

    let target = (rules.min_qty * raw_mult).min(position_amt_abs);
    let mut target = round_qty_down(target, rules.step_size);

    if target < rules.min_qty || target * last_trade_price < rules.min_notional {
        // `is_side_done` above already confirmed the whole remaining
        // position clears min_notional, so enlarging up to it (floored to
        // the step grid, never exceeding the position — reduce-only must
        // never ask for more than is held) always succeeds here.
        target = round_qty_down(position_amt_abs, rules.step_size);
    }

    while target * last_trade_price > max_order_notional && target > rules.step_size {
        target -= rules.step_size;
    }

    if target.is_zero() {
        return None;
    }
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules() -> InstrumentRules {
        InstrumentRules::new("BTCUSDT", dec!(0.01), dec!(0.001), dec!(0.001), dec!(5), 10)
    }

    #[test]
    fn s1_happy_path_is_done_under_min_notional() {
        // Position LONG 0.010 @ last trade 200.00; min_qty*mult = 0.001,
        // which at 200 notional is 0.20 < 5, and enlarging to the whole
        // 0.010 position is still only 2.00 < 5 — side is done.
        let rules = rules();
        assert!(is_side_done(dec!(0.010), &rules, dec!(200)));
        assert_eq!(
            compose_quantity(dec!(0.010), &rules, dec!(200), dec!(1), dec!(1000)),
            None
        );
    }

    #[test]
    fn enlarges_to_clear_min_notional_when_possible() {
        let rules = rules();
        // Position large enough that enlarging to it clears min_notional.
        let qty = compose_quantity(dec!(1.0), &rules, dec!(200), dec!(1), dec!(1000)).unwrap();
        // min_qty*mult=0.001 -> 0.001*200=0.2 < 5 -> enlarge to whole position (1.0).
        assert_eq!(qty, dec!(1.000));
    }

    #[test]
    fn caps_at_max_order_notional_by_stepping_down() {
        let rules = rules();
        // Large raw_mult would otherwise ask for a big notional order.
        let qty = compose_quantity(dec!(10.0), &rules, dec!(200), dec!(5), dec!(100)).unwrap();
        assert!(qty * dec!(200) <= dec!(100));
    }

    #[test]
    fn never_exceeds_position_amt() {
        let rules = rules();
        let qty = compose_quantity(dec!(0.5), &rules, dec!(200), dec!(5), dec!(100_000)).unwrap();
        assert!(qty <= dec!(0.5));
    }

    proptest::proptest! {
        #[test]
        fn composed_quantity_never_exceeds_position(
            pos_raw in 1i64..1_000_000i64,
            mult_raw in 1i64..500i64,
        ) {
            let rules = rules();
            let position = Decimal::new(pos_raw, 3);
            let mult = Decimal::new(mult_raw, 1);
            if let Some(qty) = compose_quantity(position, &rules, dec!(200), mult, dec!(1_000_000)) {
                prop_assert!(qty <= position);
            }
        }
    }
}
