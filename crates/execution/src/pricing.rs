//! Maker-only and aggressive-limit pricing, both rounded to the tick grid
//! in the conservative direction.

use common::config::PricingMode;
use common::{MarketSnapshot, OrderDirection};
use rounding::{round_price, RoundDirection};
use rust_decimal::Decimal;

/// Maker-only (`GTX`, post-only) price: the opposite touch, shifted by the
/// configured pricing mode, then pushed out by `safety_ticks` so a post-only
/// order can't cross. Rounded toward the side that preserves the safety
/// margin: up for a sell, down for a buy.
pub fn maker_price(
    direction: OrderDirection,
    snapshot: &MarketSnapshot,
    tick_size: Decimal,
    pricing: PricingMode,
    safety_ticks: u32,
) -> Option<Decimal> {
    let safety = tick_size * Decimal::from(safety_ticks);
    match direction {
        OrderDirection::Sell => {
            let touch = snapshot.best_ask?;
            let raw = match pricing {
                PricingMode::AtTouch => touch,
                PricingMode::InsideSpread1Tick => touch - tick_size,
                PricingMode::CustomTicks(n) => touch - tick_size * Decimal::from(n),
            };
            let floor = snapshot.best_bid? + safety;
            Some(round_price(raw.max(floor), tick_size, RoundDirection::Up))
        }
        OrderDirection::Buy => {
            let touch = snapshot.best_bid?;
            let raw = match pricing {
                PricingMode::AtTouch => touch,
                PricingMode::InsideSpread1Tick => touch + tick_size,
                PricingMode::CustomTicks(n) => touch + tick_size * Decimal::from(n),
            };
            let ceiling = snapshot.best_ask? - safety;
            Some(round_price(raw.min(ceiling), tick_size, RoundDirection::Down))
        }
    }
}

/// Aggressive-limit (`GTC`) price: same-side touch, to encourage an
/// immediate cross.
pub fn aggressive_price(direction: OrderDirection, snapshot: &MarketSnapshot, tick_size: Decimal) -> Option<Decimal> {
    match direction {
        OrderDirection::Sell => Some(round_price(snapshot.best_bid?, tick_size, RoundDirection::Down)),
        OrderDirection::Buy => Some(round_price(snapshot.best_ask?, tick_size, RoundDirection::Up)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snap() -> MarketSnapshot {
        let mut s = MarketSnapshot::new("BTCUSDT");
        s.best_bid = Some(dec!(199.98));
        s.best_ask = Some(dec!(200.00));
        s.last_trade_price = Some(dec!(200.00));
        s.previous_trade_price = Some(dec!(199.99));
        s
    }

    #[test]
    fn maker_sell_respects_safety_distance() {
        let price = maker_price(OrderDirection::Sell, &snap(), dec!(0.01), PricingMode::AtTouch, 1).unwrap();
        // opposite touch is best_ask=200.00, well clear of the bid+safety floor.
        assert_eq!(price, dec!(200.00));
        // floor is best_bid + 1 tick = 199.99 — price can never be pushed below it.
        assert!(price >= dec!(199.98) + dec!(0.01));
    }

    #[test]
    fn maker_buy_respects_safety_distance() {
        let price = maker_price(OrderDirection::Buy, &snap(), dec!(0.01), PricingMode::AtTouch, 1).unwrap();
        assert_eq!(price, dec!(199.98));
        assert!(price <= dec!(200.00) - dec!(0.01));
    }

    #[test]
    fn aggressive_sell_uses_same_side_touch() {
        let price = aggressive_price(OrderDirection::Sell, &snap(), dec!(0.01)).unwrap();
        assert_eq!(price, dec!(199.98));
    }

    #[test]
    fn aggressive_buy_uses_same_side_touch() {
        let price = aggressive_price(OrderDirection::Buy, &snap(), dec!(0.01)).unwrap();
        assert_eq!(price, dec!(200.00));
    }

    #[test]
    fn inside_spread_one_tick_moves_off_the_touch() {
        let price = maker_price(OrderDirection::Sell, &snap(), dec!(0.01), PricingMode::InsideSpread1Tick, 1).unwrap();
        assert_eq!(price, dec!(199.99));
    }
}
