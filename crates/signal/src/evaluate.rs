//! Pure exit-condition and multiplier-tier evaluation, kept free of any
//! engine state so the truth tables are easy to check in isolation.

use common::config::MultiplierTier;
use common::{ExitReason, MarketSnapshot, Side};
use rust_decimal::Decimal;

/// Evaluate the exit condition for `side` against `snapshot`. `None` if
/// neither the primary nor the bid/ask-improve condition holds.
///
/// LONG: `long_primary := last > prev && best_bid >= last`;
///       `long_bid_improve := !long_primary && best_bid >= last && best_bid > prev`.
/// SHORT is the mirror image with `<`/`best_ask`.
pub fn exit_condition(side: Side, snapshot: &MarketSnapshot) -> Option<ExitReason> {
    let last = snapshot.last_trade_price?;
    let prev = snapshot.previous_trade_price?;
    let bid = snapshot.best_bid?;
    let ask = snapshot.best_ask?;

    match side {
        Side::Long => {
            let primary = last > prev && bid >= last;
            if primary {
                return Some(ExitReason::LongPrimary);
            }
            if bid >= last && bid > prev {
                return Some(ExitReason::LongBidImprove);
            }
            None
        }
        Side::Short => {
            let primary = last < prev && ask <= last;
            if primary {
                return Some(ExitReason::ShortPrimary);
            }
            if ask <= last && ask < prev {
                return Some(ExitReason::ShortAskImprove);
            }
            None
        }
    }
}

/// Highest `mult` among acceleration tiers satisfied by `ret_window`,
/// direction-aware: LONG wants `ret_window >= tier.threshold`, SHORT wants
/// `ret_window <= -tier.threshold`. Defaults to `1` when no tier qualifies.
pub fn highest_satisfied_accel(side: Side, ret_window: Decimal, tiers: &[MultiplierTier]) -> Decimal {
    tiers
        .iter()
        .filter(|tier| match side {
            Side::Long => ret_window >= tier.threshold,
            Side::Short => ret_window <= -tier.threshold,
        })
        .map(|tier| tier.mult)
        .fold(Decimal::ONE, Decimal::max)
}

/// Highest `mult` among ROI tiers satisfied by `roi >= tier.threshold`.
/// Defaults to `1` when no tier qualifies.
pub fn highest_satisfied_roi(roi: Decimal, tiers: &[MultiplierTier]) -> Decimal {
    tiers
        .iter()
        .filter(|tier| roi >= tier.threshold)
        .map(|tier| tier.mult)
        .fold(Decimal::ONE, Decimal::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snap(last: Decimal, prev: Decimal, bid: Decimal, ask: Decimal) -> MarketSnapshot {
        let mut s = MarketSnapshot::new("BTCUSDT");
        s.previous_trade_price = Some(prev);
        s.last_trade_price = Some(last);
        s.best_bid = Some(bid);
        s.best_ask = Some(ask);
        s
    }

    #[test]
    fn long_primary_and_bid_improve_are_mutually_exclusive() {
        // last > prev, bid >= last -> primary.
        let s = snap(dec!(100), dec!(99), dec!(100), dec!(100.1));
        assert_eq!(exit_condition(Side::Long, &s), Some(ExitReason::LongPrimary));

        // last <= prev, but bid improved beyond prev -> bid_improve, not primary.
        let s = snap(dec!(99), dec!(99), dec!(99.5), dec!(100));
        assert_eq!(exit_condition(Side::Long, &s), Some(ExitReason::LongBidImprove));
    }

    #[test]
    fn long_no_condition_when_bid_lags() {
        let s = snap(dec!(100), dec!(99), dec!(98), dec!(100.1));
        assert_eq!(exit_condition(Side::Long, &s), None);
    }

    #[test]
    fn short_mirrors_long() {
        let s = snap(dec!(99), dec!(100), dec!(98.9), dec!(99));
        assert_eq!(exit_condition(Side::Short, &s), Some(ExitReason::ShortPrimary));

        let s = snap(dec!(100), dec!(100), dec!(99), dec!(99.5));
        assert_eq!(exit_condition(Side::Short, &s), Some(ExitReason::ShortAskImprove));
    }

    #[test]
    fn accel_tier_tie_break_picks_highest_not_closest() {
        let tiers = vec![
            MultiplierTier { threshold: dec!(0.001), mult: dec!(1.2) },
            MultiplierTier { threshold: dec!(0.005), mult: dec!(2.0) },
        ];
        // Satisfies both tiers; closest threshold is 0.005 (mult 2.0), which
        // happens to also be highest here, so use a case where they diverge.
        let tiers_diverging = vec![
            MultiplierTier { threshold: dec!(0.001), mult: dec!(3.0) },
            MultiplierTier { threshold: dec!(0.005), mult: dec!(2.0) },
        ];
        assert_eq!(highest_satisfied_accel(Side::Long, dec!(0.01), &tiers), dec!(2.0));
        assert_eq!(
            highest_satisfied_accel(Side::Long, dec!(0.01), &tiers_diverging),
            dec!(3.0)
        );
    }

    #[test]
    fn accel_short_uses_negative_threshold() {
        let tiers = vec![MultiplierTier { threshold: dec!(0.002), mult: dec!(1.5) }];
        assert_eq!(highest_satisfied_accel(Side::Short, dec!(-0.003), &tiers), dec!(1.5));
        assert_eq!(highest_satisfied_accel(Side::Short, dec!(0.003), &tiers), Decimal::ONE);
    }

    #[test]
    fn roi_defaults_to_one_when_no_tier_satisfied() {
        let tiers = vec![MultiplierTier { threshold: dec!(0.5), mult: dec!(2.0) }];
        assert_eq!(highest_satisfied_roi(dec!(0.1), &tiers), Decimal::ONE);
        assert_eq!(highest_satisfied_roi(dec!(0.6), &tiers), dec!(2.0));
    }
}
