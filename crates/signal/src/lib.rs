//! Signal engine: maintains per-symbol market snapshots and price history,
//! evaluates exit conditions per `(symbol, side)`, and throttles emission.

mod evaluate;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{
    config::SignalConfig, ExitSignal, MarketSnapshot, Position, PriceHistory, Side,
};
use tracing::trace;

pub use evaluate::exit_condition;

pub struct SignalEngine {
    snapshots: HashMap<String, MarketSnapshot>,
    histories: HashMap<String, PriceHistory>,
    last_signal_at: HashMap<(String, Side), DateTime<Utc>>,
    config: SignalConfig,
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            snapshots: HashMap::new(),
            histories: HashMap::new(),
            last_signal_at: HashMap::new(),
            config,
        }
    }

    fn snapshot_mut(&mut self, symbol: &str) -> &mut MarketSnapshot {
        self.snapshots
            .entry(symbol.to_string())
            .or_insert_with(|| MarketSnapshot::new(symbol))
    }

    fn history_mut(&mut self, symbol: &str) -> &mut PriceHistory {
        let window_ms = self.config.accel.window_ms;
        self.histories
            .entry(symbol.to_string())
            .or_insert_with(|| PriceHistory::new(window_ms))
    }

    pub fn on_quote(&mut self, symbol: &str, bid: rust_decimal::Decimal, ask: rust_decimal::Decimal, at: DateTime<Utc>) {
        self.snapshot_mut(symbol).apply_quote(bid, ask, at);
    }

    pub fn on_trade(&mut self, symbol: &str, price: rust_decimal::Decimal, at: DateTime<Utc>) {
        self.snapshot_mut(symbol).apply_trade(price, at);
        self.history_mut(symbol).push(at, price);
    }

    pub fn on_mark(&mut self, symbol: &str, price: rust_decimal::Decimal, at: DateTime<Utc>) {
        // Mark-price updates feed only risk, never staleness or exit
        // conditions, so they don't touch the snapshot's trade/quote path.
        self.snapshot_mut(symbol).apply_mark(price, at);
    }

    pub fn snapshot(&self, symbol: &str) -> Option<&MarketSnapshot> {
        self.snapshots.get(symbol)
    }

    /// Reset the throttle for a `(symbol, side)` — called when the position
    /// reaches zero or the side state is reset.
    pub fn reset_throttle(&mut self, symbol: &str, side: Side) {
        self.last_signal_at.remove(&(symbol.to_string(), side));
    }

    /// Evaluate whether an exit signal should fire for `(symbol, side)`
    /// right now. Returns `None` if the snapshot isn't ready, is stale, no
    /// exit condition is met, or the per-side throttle hasn't elapsed.
    pub fn evaluate(
        &mut self,
        symbol: &str,
        side: Side,
        position: &Position,
        leverage: u32,
        now: DateTime<Utc>,
    ) -> Option<ExitSignal> {
        let snapshot = self.snapshots.get(symbol)?;
        if !snapshot.is_ready() {
            return None;
        }
        if snapshot.is_stale(now, self.config.stale_data_ms) {
            trace!(symbol, "snapshot stale, suppressing signal");
            return None;
        }

        let reason = exit_condition(side, snapshot)?;

        let key = (symbol.to_string(), side);
        if let Some(last) = self.last_signal_at.get(&key) {
            let elapsed = (now - *last).num_milliseconds();
            if elapsed < self.config.min_signal_interval_ms as i64 {
                return None;
            }
        }

        let ret_window = self.histories.get(symbol).and_then(|h| h.ret_window());
        let accel_mult = ret_window
            .map(|r| evaluate::highest_satisfied_accel(side, r, &self.config.accel.tiers))
            .unwrap_or(rust_decimal::Decimal::ONE);

        let roi_mult = position
            .roi(leverage)
            .map(|roi| evaluate::highest_satisfied_roi(roi, &self.config.roi.tiers))
            .unwrap_or(rust_decimal::Decimal::ONE);

        self.last_signal_at.insert(key, now);

        Some(ExitSignal {
            symbol: symbol.to_string(),
            side,
            reason,
            roi_mult,
            accel_mult,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{AccelConfig, MultiplierTier, RoiConfig};
    use rust_decimal_macros::dec;

    fn cfg() -> SignalConfig {
        SignalConfig {
            min_signal_interval_ms: 500,
            stale_data_ms: 3_000,
            accel: AccelConfig {
                window_ms: 5_000,
                tiers: vec![MultiplierTier { threshold: dec!(0.002), mult: dec!(1.5) }],
            },
            roi: RoiConfig {
                tiers: vec![MultiplierTier { threshold: dec!(0.1), mult: dec!(1.2) }],
            },
        }
    }

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    fn pos(side: Side) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side,
            position_amt: dec!(1),
            entry_price: dec!(200),
            mark_price: dec!(200),
            liquidation_price: dec!(150),
            unrealized_pnl: dec!(0),
        }
    }

    #[test]
    fn no_signal_until_snapshot_ready() {
        let mut eng = SignalEngine::new(cfg());
        eng.on_quote("BTCUSDT", dec!(199.98), dec!(200.00), t(0));
        assert!(eng.evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(0)).is_none());
    }

    #[test]
    fn long_primary_fires_s1_scenario() {
        let mut eng = SignalEngine::new(cfg());
        eng.on_trade("BTCUSDT", dec!(199.99), t(0));
        eng.on_trade("BTCUSDT", dec!(200.00), t(100));
        eng.on_quote("BTCUSDT", dec!(200.00), dec!(200.02), t(100));
        let sig = eng
            .evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(100))
            .expect("expected a signal");
        assert_eq!(sig.reason, common::ExitReason::LongPrimary);
    }

    #[test]
    fn throttle_suppresses_consecutive_signals() {
        let mut eng = SignalEngine::new(cfg());
        eng.on_trade("BTCUSDT", dec!(199.99), t(0));
        eng.on_trade("BTCUSDT", dec!(200.00), t(100));
        eng.on_quote("BTCUSDT", dec!(200.00), dec!(200.02), t(100));
        assert!(eng.evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(100)).is_some());
        // Still within min_signal_interval_ms (500ms) — suppressed.
        assert!(eng.evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(200)).is_none());
        // Past the throttle window — fires again.
        assert!(eng.evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(700)).is_some());
    }

    #[test]
    fn reset_throttle_allows_immediate_resignal() {
        let mut eng = SignalEngine::new(cfg());
        eng.on_trade("BTCUSDT", dec!(199.99), t(0));
        eng.on_trade("BTCUSDT", dec!(200.00), t(100));
        eng.on_quote("BTCUSDT", dec!(200.00), dec!(200.02), t(100));
        assert!(eng.evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(100)).is_some());
        eng.reset_throttle("BTCUSDT", Side::Long);
        assert!(eng.evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(150)).is_some());
    }

    #[test]
    fn stale_snapshot_suppresses_signal() {
        let mut eng = SignalEngine::new(cfg());
        eng.on_trade("BTCUSDT", dec!(199.99), t(0));
        eng.on_trade("BTCUSDT", dec!(200.00), t(100));
        eng.on_quote("BTCUSDT", dec!(200.00), dec!(200.02), t(100));
        // 10s later, past the 3s stale_data_ms threshold.
        assert!(eng.evaluate("BTCUSDT", Side::Long, &pos(Side::Long), 10, t(10_100)).is_none());
    }
}
