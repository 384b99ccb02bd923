//! Pure tier-threshold math: soft de-risk hysteresis, panic-tier selection,
//! and protective-stop price derivation. No supervisor state here, so the
//! formulas from the scenarios can be checked directly.

use common::config::PanicCloseTier;
use common::Side;
use rounding::{round_price, RoundDirection};
use rust_decimal::Decimal;

/// Tier-1 soft de-risk flag with hysteresis: turns on at `d <= threshold`,
/// turns off only once `d` climbs back above `threshold + hysteresis_margin`
/// — not merely back above `threshold` — so it doesn't chatter right at the
/// boundary.
pub fn soft_derisk_active(
    d: Decimal,
    threshold: Decimal,
    hysteresis_margin: Decimal,
    currently_active: bool,
) -> bool {
    if currently_active {
        d <= threshold + hysteresis_margin
    } else {
        d <= threshold
    }
}

/// The most-dangerous panic-close tier whose `d_threshold` is satisfied
/// (`d <= d_threshold`): the smallest satisfied threshold, since tiers are
/// configured from loosest to tightest as danger increases.
pub fn select_panic_tier(d: Decimal, tiers: &[PanicCloseTier]) -> Option<&PanicCloseTier> {
    tiers
        .iter()
        .filter(|tier| d <= tier.d_threshold)
        .min_by_key(|tier| tier.d_threshold)
}

/// Protective-stop trigger price derived from the venue's liquidation price:
/// LONG rounds up (`liquidation / (1 - D)`), SHORT rounds down
/// (`liquidation / (1 + D)`), so the stop always sits strictly on the safe
/// side of the liquidation price after grid rounding.
pub fn protective_stop_price(side: Side, liquidation_price: Decimal, dist_to_liq: Decimal, tick_size: Decimal) -> Decimal {
    match side {
        Side::Long => round_price(
            liquidation_price / (Decimal::ONE - dist_to_liq),
            tick_size,
            RoundDirection::Up,
        ),
        Side::Short => round_price(
            liquidation_price / (Decimal::ONE + dist_to_liq),
            tick_size,
            RoundDirection::Down,
        ),
    }
}

/// Whether `candidate` is strictly safer than `current`: higher for LONG,
/// lower for SHORT. Replacements are only ever issued when this holds.
pub fn is_stricter(side: Side, candidate: Decimal, current: Decimal) -> bool {
    match side {
        Side::Long => candidate > current,
        Side::Short => candidate < current,
    }
}

/// Whether an externally observed stop's trigger price sits on the correct
/// side of the liquidation price, within `tolerance`. A stop with no price
/// (e.g. a take-profit) can't be judged this way and is treated as valid.
pub fn external_stop_is_valid(
    side: Side,
    stop_price: Option<Decimal>,
    liquidation_price: Decimal,
    tolerance: Decimal,
) -> bool {
    let Some(stop_price) = stop_price else { return true };
    match side {
        Side::Long => stop_price >= liquidation_price - tolerance,
        Side::Short => stop_price <= liquidation_price + tolerance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tiers() -> Vec<PanicCloseTier> {
        vec![
            PanicCloseTier { d_threshold: dec!(0.012), slice_ratio: dec!(0.1), ttl_percent: dec!(0.5), maker_timeouts_to_escalate: 2 },
            PanicCloseTier { d_threshold: dec!(0.008), slice_ratio: dec!(0.25), ttl_percent: dec!(0.5), maker_timeouts_to_escalate: 2 },
        ]
    }

    #[test]
    fn s5_selects_the_loosest_satisfied_tier_when_only_one_qualifies() {
        // d=0.009 satisfies d<=0.012 but not d<=0.008.
        let tier = select_panic_tier(dec!(0.009), &tiers()).unwrap();
        assert_eq!(tier.d_threshold, dec!(0.012));
        assert_eq!(tier.slice_ratio, dec!(0.1));
    }

    #[test]
    fn selects_the_tightest_satisfied_tier_when_both_qualify() {
        let tier = select_panic_tier(dec!(0.005), &tiers()).unwrap();
        assert_eq!(tier.d_threshold, dec!(0.008));
    }

    #[test]
    fn no_tier_selected_when_d_clears_all_thresholds() {
        assert!(select_panic_tier(dec!(0.02), &tiers()).is_none());
    }

    #[test]
    fn hysteresis_keeps_flag_on_past_the_bare_threshold() {
        let threshold = dec!(0.05);
        let margin = dec!(0.01);
        assert!(soft_derisk_active(dec!(0.055), threshold, margin, true));
        assert!(!soft_derisk_active(dec!(0.065), threshold, margin, true));
        assert!(!soft_derisk_active(dec!(0.06), threshold, margin, false));
    }

    #[test]
    fn s3_protective_stop_price_matches_scenario() {
        let d = dec!(0.01);
        let tick = dec!(0.01);
        let p = protective_stop_price(Side::Long, dec!(150), d, tick);
        assert_eq!(p, dec!(151.52));
        let p2 = protective_stop_price(Side::Long, dec!(152), d, tick);
        assert_eq!(p2, dec!(153.54));
        assert!(is_stricter(Side::Long, p2, p));
        let p3 = protective_stop_price(Side::Long, dec!(151), d, tick);
        assert!(!is_stricter(Side::Long, p3, p2));
    }

    #[test]
    fn external_stop_tolerance_check() {
        let tol = dec!(0.0001);
        assert!(external_stop_is_valid(Side::Long, Some(dec!(151.5)), dec!(150), tol));
        assert!(!external_stop_is_valid(Side::Long, Some(dec!(149)), dec!(150), tol));
        assert!(external_stop_is_valid(Side::Long, None, dec!(150), tol));
    }
}
