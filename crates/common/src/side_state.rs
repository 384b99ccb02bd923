use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Placing,
    Waiting,
    Canceling,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    MakerOnly,
    AggressiveLimit,
}

/// The authoritative per-`(symbol, side)` state the execution engine owns.
/// Created on first observation of a non-zero position; recycled (counters
/// reset, not destroyed) when the position returns to zero, so a reopened
/// position reuses the same instance.
#[derive(Debug, Clone)]
pub struct SideExecutionState {
    pub symbol: String,
    pub side: crate::position::Side,

    pub state: ExecutionState,
    pub mode: Mode,

    pub current_order_id: Option<String>,
    pub current_client_id: Option<String>,
    pub order_placed_at_ms: Option<i64>,
    pub order_ttl_ms: Option<u64>,

    pub maker_timeout_count: u32,
    pub aggr_timeout_count: u32,
    pub aggr_fill_count: u32,

    pub maker_submissions: u64,
    pub maker_fills: u64,

    pub cooldown_until_ms: Option<i64>,

    /// Set by the risk supervisor to force `AGGRESSIVE_LIMIT` regardless of
    /// escalation counters. Cleared once the risk supervisor lifts it.
    pub force_aggressive: bool,

    /// Timestamp of the last signal admitted for this `(symbol, side)`,
    /// used by the signal engine's throttle.
    pub last_signal_at_ms: Option<i64>,

    /// Cancel was issued; this is the grace deadline after which the side
    /// moves to COOLDOWN even without an ack, per the lost-cancel-ack
    /// invariant.
    pub cancel_issued_at_ms: Option<i64>,

    /// Whether the currently live order was submitted by the risk
    /// supervisor's panic-close path rather than the signal engine.
    pub current_is_risk: bool,

    /// Per-tier `maker_timeouts_to_escalate` override supplied by an active
    /// panic-close tier, overriding the fill-ratio-derived threshold while
    /// the current order is a panic order.
    pub escalate_override: Option<u32>,
}

impl SideExecutionState {
    pub fn new(symbol: impl Into<String>, side: crate::position::Side) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            state: ExecutionState::Idle,
            mode: Mode::MakerOnly,
            current_order_id: None,
            current_client_id: None,
            order_placed_at_ms: None,
            order_ttl_ms: None,
            maker_timeout_count: 0,
            aggr_timeout_count: 0,
            aggr_fill_count: 0,
            maker_submissions: 0,
            maker_fills: 0,
            cooldown_until_ms: None,
            force_aggressive: false,
            last_signal_at_ms: None,
            cancel_issued_at_ms: None,
            current_is_risk: false,
            escalate_override: None,
        }
    }

    /// Laplace-smoothed fill ratio: `(fills + 1) / (submissions + 2)`.
    pub fn maker_fill_ratio(&self) -> f64 {
        (self.maker_fills as f64 + 1.0) / (self.maker_submissions as f64 + 2.0)
    }

    /// Reset escalation counters. Called on partial fill and on mode change.
    pub fn reset_timeout_counters(&mut self) {
        self.maker_timeout_count = 0;
        self.aggr_timeout_count = 0;
        self.aggr_fill_count = 0;
    }

    /// Recycle this state when the position returns to zero: counters and
    /// feedback reset, but the instance is kept (not destroyed) so a
    /// reopened position can reuse it.
    pub fn recycle(&mut self) {
        self.state = ExecutionState::Idle;
        self.mode = Mode::MakerOnly;
        self.current_order_id = None;
        self.current_client_id = None;
        self.order_placed_at_ms = None;
        self.order_ttl_ms = None;
        self.reset_timeout_counters();
        self.maker_submissions = 0;
        self.maker_fills = 0;
        self.cooldown_until_ms = None;
        self.force_aggressive = false;
        self.last_signal_at_ms = None;
        self.cancel_issued_at_ms = None;
        self.current_is_risk = false;
        self.escalate_override = None;
    }

    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn order_age_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.order_placed_at_ms
            .map(|placed| now.timestamp_millis() - placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Side;

    #[test]
    fn fill_ratio_is_laplace_smoothed() {
        let mut s = SideExecutionState::new("BTCUSDT", Side::Long);
        // No submissions yet: (0+1)/(0+2) = 0.5
        assert_eq!(s.maker_fill_ratio(), 0.5);
        s.maker_submissions = 10;
        s.maker_fills = 10;
        // (10+1)/(10+2) = 11/12
        assert!((s.maker_fill_ratio() - 11.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn recycle_resets_counters_but_keeps_the_instance() {
        let mut s = SideExecutionState::new("BTCUSDT", Side::Long);
        s.maker_timeout_count = 3;
        s.mode = Mode::AggressiveLimit;
        s.maker_submissions = 7;
        s.recycle();
        assert_eq!(s.maker_timeout_count, 0);
        assert_eq!(s.mode, Mode::MakerOnly);
        assert_eq!(s.maker_submissions, 0);
        assert_eq!(s.symbol, "BTCUSDT");
    }
}
