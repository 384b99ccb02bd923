use parking_lot::RwLock;
use rust_decimal::Decimal;

/// Per-instrument exchange grid and minimums. Shared read-only after load
/// via `Arc<InstrumentRules>`; only `leverage` is ever rewritten in place,
/// and only by a recalibration pass — everything else requires replacing
/// the whole `Arc`.
#[derive(Debug)]
pub struct InstrumentRules {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    leverage: RwLock<u32>,
}

impl InstrumentRules {
    pub fn new(
        symbol: impl Into<String>,
        tick_size: Decimal,
        step_size: Decimal,
        min_qty: Decimal,
        min_notional: Decimal,
        leverage: u32,
    ) -> Self {
        assert!(tick_size > Decimal::ZERO, "tick_size must be positive");
        assert!(step_size > Decimal::ZERO, "step_size must be positive");
        assert!(min_qty > Decimal::ZERO, "min_qty must be positive");
        assert!(min_notional > Decimal::ZERO, "min_notional must be positive");
        assert!(step_size <= min_qty, "step_size must be <= min_qty");

        Self {
            symbol: symbol.into(),
            tick_size,
            step_size,
            min_qty,
            min_notional,
            leverage: RwLock::new(leverage),
        }
    }

    pub fn leverage(&self) -> u32 {
        *self.leverage.read()
    }

    /// Only called from a recalibration pass.
    pub fn set_leverage(&self, leverage: u32) {
        *self.leverage.write() = leverage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    #[should_panic(expected = "step_size must be <= min_qty")]
    fn rejects_step_size_above_min_qty() {
        InstrumentRules::new("BTCUSDT", dec!(0.1), dec!(0.01), dec!(0.001), dec!(5), 10);
    }

    #[test]
    fn leverage_is_updatable_without_replacing_the_instance() {
        let rules = InstrumentRules::new("BTCUSDT", dec!(0.1), dec!(0.001), dec!(0.001), dec!(5), 10);
        assert_eq!(rules.leverage(), 10);
        rules.set_leverage(20);
        assert_eq!(rules.leverage(), 20);
    }
}
