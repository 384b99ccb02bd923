use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which leg of a hedge-mode position this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// A hedge-mode position on one symbol/side. Removed from the cache entirely
/// once `position_amt` returns to zero — no ghost positions are kept around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Signed in the direction of `side`; always non-negative magnitude-wise
    /// since `side` already carries the sign's meaning, but kept as the
    /// exchange reports it (positive for both legs in hedge mode).
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Position {
    pub fn is_zero(&self) -> bool {
        self.position_amt.is_zero()
    }

    pub fn abs_qty(&self) -> Decimal {
        self.position_amt.abs()
    }

    /// `|mark - liquidation| / mark`, the risk supervisor's distance metric.
    /// `None` if mark price is zero (nothing to divide by yet).
    pub fn distance_to_liquidation(&self) -> Option<Decimal> {
        if self.mark_price.is_zero() {
            return None;
        }
        Some((self.mark_price - self.liquidation_price).abs() / self.mark_price)
    }

    /// `unrealized_pnl / (|position_amt| * entry_price / leverage)`.
    pub fn roi(&self, leverage: u32) -> Option<Decimal> {
        if self.entry_price.is_zero() || leverage == 0 {
            return None;
        }
        let margin = self.abs_qty() * self.entry_price / Decimal::from(leverage);
        if margin.is_zero() {
            return None;
        }
        Some(self.unrealized_pnl / margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pos() -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            position_amt: dec!(1.5),
            entry_price: dec!(200),
            mark_price: dec!(150),
            liquidation_price: dec!(148.5),
            unrealized_pnl: dec!(-75),
        }
    }

    #[test]
    fn distance_to_liquidation_matches_definition() {
        let p = pos();
        let d = p.distance_to_liquidation().unwrap();
        assert_eq!(d, (dec!(150) - dec!(148.5)).abs() / dec!(150));
    }

    #[test]
    fn roi_matches_definition() {
        let p = pos();
        let roi = p.roi(10).unwrap();
        let margin = dec!(1.5) * dec!(200) / dec!(10);
        assert_eq!(roi, dec!(-75) / margin);
    }
}
