use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Best bid/ask + last trade snapshot for one symbol, with per-stream
/// update timestamps so staleness can be judged independently of whether
/// the *value* changed.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub last_trade_price: Option<Decimal>,
    pub previous_trade_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub quote_updated_at: Option<DateTime<Utc>>,
    pub trade_updated_at: Option<DateTime<Utc>>,
    pub mark_updated_at: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            best_bid: None,
            best_ask: None,
            last_trade_price: None,
            previous_trade_price: None,
            mark_price: None,
            quote_updated_at: None,
            trade_updated_at: None,
            mark_updated_at: None,
        }
    }

    /// A snapshot is ready once both sides of the book and at least two
    /// trades have been observed.
    pub fn is_ready(&self) -> bool {
        self.best_bid.is_some()
            && self.best_ask.is_some()
            && self.last_trade_price.is_some()
            && self.previous_trade_price.is_some()
    }

    /// Apply a new quote. Snapshots where `best_bid >= best_ask` are
    /// discarded (the caller should not update `quote_updated_at` either),
    /// returning `false`.
    pub fn apply_quote(&mut self, bid: Decimal, ask: Decimal, at: DateTime<Utc>) -> bool {
        if bid >= ask {
            return false;
        }
        self.best_bid = Some(bid);
        self.best_ask = Some(ask);
        self.quote_updated_at = Some(at);
        true
    }

    pub fn apply_trade(&mut self, price: Decimal, at: DateTime<Utc>) {
        if let Some(last) = self.last_trade_price {
            self.previous_trade_price = Some(last);
        }
        self.last_trade_price = Some(price);
        self.trade_updated_at = Some(at);
    }

    /// Mark-price updates feed only risk, never staleness.
    pub fn apply_mark(&mut self, price: Decimal, at: DateTime<Utc>) {
        self.mark_price = Some(price);
        self.mark_updated_at = Some(at);
    }

    /// Youngest of (trade, quote) update ages, in milliseconds, as of `now`.
    /// `None` if neither stream has ever updated.
    pub fn staleness_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let youngest = match (self.trade_updated_at, self.quote_updated_at) {
            (Some(t), Some(q)) => t.max(q),
            (Some(t), None) => t,
            (None, Some(q)) => q,
            (None, None) => return None,
        };
        Some((now - youngest).num_milliseconds())
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_data_ms: i64) -> bool {
        match self.staleness_ms(now) {
            None => true,
            Some(age) => age > stale_data_ms,
        }
    }
}

/// Bounded (timestamp, last_trade_price) history for one symbol, trimmed to
/// cover `window_ms`.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    window_ms: i64,
    points: VecDeque<(DateTime<Utc>, Decimal)>,
}

impl PriceHistory {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            points: VecDeque::new(),
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, price: Decimal) {
        self.points.push_back((at, price));
        let cutoff = at - chrono::Duration::milliseconds(self.window_ms);
        while let Some((ts, _)) = self.points.front() {
            if *ts < cutoff {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    /// `price_now / price_at_window_start - 1`, or `None` if there isn't
    /// yet a point old enough to anchor the window.
    pub fn ret_window(&self) -> Option<Decimal> {
        let (_, oldest) = self.points.front()?;
        let (_, newest) = self.points.back()?;
        if oldest.is_zero() {
            return None;
        }
        Some(*newest / *oldest - Decimal::ONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn snapshot_not_ready_until_two_trades_and_a_quote() {
        let mut s = MarketSnapshot::new("BTCUSDT");
        assert!(!s.is_ready());
        s.apply_quote(dec!(99), dec!(101), t(0));
        assert!(!s.is_ready());
        s.apply_trade(dec!(100), t(1));
        assert!(!s.is_ready());
        s.apply_trade(dec!(100.5), t(2));
        assert!(s.is_ready());
    }

    #[test]
    fn crossed_quote_is_discarded() {
        let mut s = MarketSnapshot::new("BTCUSDT");
        assert!(!s.apply_quote(dec!(101), dec!(99), t(0)));
        assert!(s.best_bid.is_none());
    }

    #[test]
    fn mark_update_does_not_affect_staleness() {
        let mut s = MarketSnapshot::new("BTCUSDT");
        s.apply_trade(dec!(100), t(0));
        s.apply_mark(dec!(100), t(100_000));
        // staleness is judged from the trade timestamp (t=0), not the mark
        // update at t=100s.
        assert_eq!(s.staleness_ms(t(100_000)), Some(100_000));
    }

    #[test]
    fn price_history_trims_to_window_and_computes_return() {
        let mut h = PriceHistory::new(1_000);
        h.push(t(0), dec!(100));
        h.push(t(500), dec!(105));
        h.push(t(1_500), dec!(110));
        // t=0 point should have been trimmed (1500 - 1000 = 500 cutoff)
        assert_eq!(h.points.len(), 2);
        let ret = h.ret_window().unwrap();
        assert_eq!(ret, dec!(110) / dec!(105) - Decimal::ONE);
    }
}
