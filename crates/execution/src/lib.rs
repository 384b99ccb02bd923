//! Per-`(symbol, side)` execution state machine: turns signals (and panic
//! intents from the risk supervisor) into order-submit / order-cancel
//! intents, and order-update events back into state transitions.

mod pricing;
mod quantity;

use std::collections::HashMap;

use common::config::{ExecutionConfig, PanicCloseTier};
use common::{
    ErrorKind, ExecutionState, ExitSignal, InstrumentRules, MarketSnapshot, Mode, OrderDirection,
    OrderIntent, OrderStatus, OrderType, OrderUpdate, Position, Side, SideExecutionState,
    TimeInForce,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

pub use pricing::{aggressive_price, maker_price};
pub use quantity::{compose_quantity, is_side_done};

/// A cancellation the engine wants issued for a live order.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub symbol: String,
    pub side: Side,
    pub order_id: Option<String>,
    pub client_id: Option<String>,
    pub is_algo: bool,
}

pub struct ExecutionEngine {
    states: HashMap<(String, Side), SideExecutionState>,
    config: ExecutionConfig,
    run_id: String,
    client_id_prefix: String,
    next_seq: u64,
}

impl ExecutionEngine {
    pub fn new(config: ExecutionConfig, run_id: impl Into<String>, client_id_prefix: impl Into<String>) -> Self {
        Self {
            states: HashMap::new(),
            config,
            run_id: run_id.into(),
            client_id_prefix: client_id_prefix.into(),
            next_seq: 0,
        }
    }

    pub fn state(&self, symbol: &str, side: Side) -> Option<&SideExecutionState> {
        self.states.get(&(symbol.to_string(), side))
    }

    /// Tier-1 soft de-risk hook: the risk supervisor forces AGGRESSIVE_LIMIT
    /// pricing for a side by setting this flag, and lifts it once `d`
    /// recovers past the hysteresis margin. This is the only way risk
    /// reaches into execution — never a direct state mutation.
    pub fn set_force_aggressive(&mut self, symbol: &str, side: Side, value: bool) {
        self.ensure_state(symbol, side).force_aggressive = value;
    }

    fn ensure_state(&mut self, symbol: &str, side: Side) -> &mut SideExecutionState {
        self.states
            .entry((symbol.to_string(), side))
            .or_insert_with(|| SideExecutionState::new(symbol, side))
    }

    /// Stable run-scoped prefix: `<client_id_prefix>-<run_id>-`. Only
    /// client ids starting with this may be cancelled by shutdown or
    /// recalibration.
    pub fn run_prefix(&self) -> String {
        format!("{}-{}-", self.client_id_prefix, self.run_id)
    }

    pub fn is_own_client_id(&self, client_id: &str) -> bool {
        client_id.starts_with(&self.run_prefix())
    }

    fn next_client_id(&mut self, now_ms: i64) -> String {
        self.next_seq += 1;
        format!("{}{}-{now_ms}", self.run_prefix(), self.next_seq)
    }

    fn direction_for(side: Side) -> OrderDirection {
        match side {
            Side::Long => OrderDirection::Sell,
            Side::Short => OrderDirection::Buy,
        }
    }

    fn price_for(
        &self,
        direction: OrderDirection,
        mode: Mode,
        snapshot: &MarketSnapshot,
        rules: &InstrumentRules,
    ) -> Option<Decimal> {
        match mode {
            Mode::MakerOnly => maker_price(
                direction,
                snapshot,
                rules.tick_size,
                self.config.maker_pricing,
                self.config.maker_safety_ticks,
            ),
            Mode::AggressiveLimit => aggressive_price(direction, snapshot, rules.tick_size),
        }
    }

    fn raw_mult(&self, roi_mult: Decimal, accel_mult: Decimal) -> Decimal {
        (self.config.base_lot_mult * roi_mult * accel_mult).min(self.config.max_mult)
    }

    /// Entry point for a normal signal. Only does anything if the side is
    /// currently `IDLE`; otherwise the signal is simply wasted, matching
    /// "at most one in-flight own order per side".
    pub fn submit_for_signal(
        &mut self,
        signal: &ExitSignal,
        position: &Position,
        rules: &InstrumentRules,
        snapshot: &MarketSnapshot,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        let symbol = signal.symbol.clone();
        let side = signal.side;
        let raw_mult = self.raw_mult(signal.roi_mult, signal.accel_mult);
        self.try_submit(&symbol, side, position, rules, snapshot, raw_mult, None, false, now_ms, None)
    }

    /// The mandated single retry after a `post_only_reject`: same signal
    /// opportunity, same quantity math, but priced at `AGGRESSIVE_LIMIT`
    /// for this one attempt only. Does not touch the side's persisted
    /// `mode` or rotation counters — those still rotate on the normal
    /// fill-ratio schedule.
    pub fn retry_with_aggressive_pricing(
        &mut self,
        signal: &ExitSignal,
        position: &Position,
        rules: &InstrumentRules,
        snapshot: &MarketSnapshot,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        let symbol = signal.symbol.clone();
        let side = signal.side;
        let raw_mult = self.raw_mult(signal.roi_mult, signal.accel_mult);
        self.try_submit(&symbol, side, position, rules, snapshot, raw_mult, None, false, now_ms, Some(Mode::AggressiveLimit))
    }

    /// Entry point for the risk supervisor's tier-2 panic-close path.
    /// Bypasses the signal engine entirely; the caller must also bypass
    /// the rate limiter for the returned intent (`is_risk = true`).
    pub fn submit_for_panic(
        &mut self,
        symbol: &str,
        side: Side,
        tier: &PanicCloseTier,
        position: &Position,
        rules: &InstrumentRules,
        snapshot: &MarketSnapshot,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        let slice_qty = rounding::round_qty_down(position.abs_qty() * tier.slice_ratio, rules.step_size);
        if slice_qty.is_zero() {
            return None;
        }
        let ttl_ms = (Decimal::from(self.config.maker_order_ttl_ms) * tier.ttl_percent)
            .round()
            .to_u64()
            .unwrap_or(self.config.maker_order_ttl_ms);
        self.try_submit(
            symbol,
            side,
            position,
            rules,
            snapshot,
            Decimal::ONE, // panic slices size off slice_ratio directly, not the normal multipliers
            Some((slice_qty, ttl_ms, tier.maker_timeouts_to_escalate)),
            true,
            now_ms,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn try_submit(
        &mut self,
        symbol: &str,
        side: Side,
        position: &Position,
        rules: &InstrumentRules,
        snapshot: &MarketSnapshot,
        raw_mult: Decimal,
        panic_override: Option<(Decimal, u64, u32)>,
        is_risk: bool,
        now_ms: i64,
        mode_override: Option<Mode>,
    ) -> Option<OrderIntent> {
        let last_price = snapshot.last_trade_price?;

        {
            let state = self.ensure_state(symbol, side);
            if state.state != ExecutionState::Idle {
                return None;
            }
        }

        let mode = mode_override.unwrap_or_else(|| {
            self.states
                .get(&(symbol.to_string(), side))
                .map(|s| if s.force_aggressive { Mode::AggressiveLimit } else { s.mode })
                .unwrap_or(Mode::MakerOnly)
        });

        let (quantity, ttl_ms, escalate_override) = match panic_override {
            Some((qty, ttl, escalate)) => (Some(qty), ttl, Some(escalate)),
            None => (None, self.ttl_for_mode(mode), None),
        };

        let quantity = match quantity {
            Some(q) => q,
            None => compose_quantity(
                position.abs_qty(),
                rules,
                last_price,
                raw_mult,
                self.config.max_order_notional,
            )?,
        };

        let direction = Self::direction_for(side);
        let (order_type, time_in_force, price) = match mode {
            Mode::MakerOnly => (
                OrderType::Limit,
                TimeInForce::Gtx,
                self.price_for(direction, Mode::MakerOnly, snapshot, rules)?,
            ),
            Mode::AggressiveLimit => (
                OrderType::Limit,
                TimeInForce::Gtc,
                self.price_for(direction, Mode::AggressiveLimit, snapshot, rules)?,
            ),
        };

        let client_id = self.next_client_id(now_ms);
        let intent = OrderIntent::new(
            symbol,
            direction,
            side,
            quantity,
            Some(price),
            order_type,
            time_in_force,
            client_id.clone(),
            is_risk,
            ttl_ms,
        );

        let state = self.ensure_state(symbol, side);
        state.state = ExecutionState::Placing;
        state.current_client_id = Some(client_id);
        state.order_ttl_ms = Some(ttl_ms);
        state.current_is_risk = is_risk;
        state.escalate_override = escalate_override;
        if mode == Mode::MakerOnly {
            state.maker_submissions += 1;
        }

        debug!(symbol, side = %side, mode = ?mode, qty = %quantity, price = %price, "submitting reduce-only order");
        Some(intent)
    }

    fn ttl_for_mode(&self, mode: Mode) -> u64 {
        match mode {
            Mode::MakerOnly => self.config.maker_order_ttl_ms,
            Mode::AggressiveLimit => self.config.aggr_order_ttl_ms,
        }
    }

    /// The venue accepted the submission: PLACING -> WAITING, arm TTL.
    pub fn confirm_submitted(&mut self, symbol: &str, side: Side, order_id: String, now_ms: i64) {
        let state = self.ensure_state(symbol, side);
        if state.state != ExecutionState::Placing {
            return;
        }
        state.current_order_id = Some(order_id);
        state.order_placed_at_ms = Some(now_ms);
        state.state = ExecutionState::Waiting;
    }

    /// The venue rejected the submission. Returns `true` if the caller
    /// should immediately retry this same signal opportunity: a
    /// `post_only_reject` retries once via
    /// [`ExecutionEngine::retry_with_aggressive_pricing`], a
    /// `duplicate_client_id` retries once with a freshly generated client
    /// id (the next call to `submit_for_signal` mints one automatically);
    /// any other rejection is logged and dropped.
    pub fn reject_submission(&mut self, symbol: &str, side: Side, kind: ErrorKind) -> bool {
        let config = self.config.clone();
        let state = self.ensure_state(symbol, side);
        state.state = ExecutionState::Idle;
        state.current_client_id = None;
        let retry = matches!(kind, ErrorKind::PostOnlyReject | ErrorKind::DuplicateClientId);
        if kind == ErrorKind::PostOnlyReject {
            state.maker_timeout_count += 1;
        } else if !retry {
            warn!(symbol, side = %side, kind = ?kind, "order submission rejected");
        }
        evaluate_mode_rotation(state, &config);
        retry
    }

    /// Dispatch an order-update from the user-data stream.
    pub fn on_order_update(&mut self, update: &OrderUpdate, now_ms: i64) {
        let config = self.config.clone();
        let state = self.ensure_state(&update.symbol, update.side);
        if state.current_order_id.as_deref() != Some(update.order_id.as_str()) {
            // Not the order we're tracking (stale/foreign update) — ignore.
            return;
        }

        match state.state {
            ExecutionState::Waiting | ExecutionState::Canceling => match update.status {
                OrderStatus::PartiallyFilled => {
                    state.reset_timeout_counters();
                }
                OrderStatus::Filled => {
                    record_terminal_fill(state, update.is_maker);
                    state.state = ExecutionState::Idle;
                    state.current_order_id = None;
                    state.current_client_id = None;
                    evaluate_mode_rotation(state, &config);
                }
                OrderStatus::Canceled | OrderStatus::Expired => {
                    state.state = ExecutionState::Cooldown;
                    state.cooldown_until_ms = Some(now_ms + config.repost_cooldown_ms as i64);
                }
                OrderStatus::New | OrderStatus::Rejected => {}
            },
            ExecutionState::Placing => {
                if update.status == OrderStatus::New {
                    state.current_order_id = Some(update.order_id.clone());
                    state.order_placed_at_ms = Some(now_ms);
                    state.state = ExecutionState::Waiting;
                }
            }
            ExecutionState::Idle | ExecutionState::Cooldown => {
                // Late update for an order we've already resolved — ignore.
            }
        }
    }

    /// Periodic timer check: TTL expiry (WAITING -> CANCELING) and cancel
    /// grace timeout (CANCELING -> COOLDOWN) and cooldown expiry
    /// (COOLDOWN -> IDLE). Returns a cancel to issue, if any.
    pub fn tick(&mut self, symbol: &str, side: Side, now_ms: i64) -> Option<CancelRequest> {
        let cancel_timeout_ms = self.config.cancel_timeout_ms as i64;
        let state = self.states.get_mut(&(symbol.to_string(), side))?;

        match state.state {
            ExecutionState::Waiting => {
                let placed = state.order_placed_at_ms?;
                let ttl = state.order_ttl_ms.unwrap_or(0) as i64;
                if now_ms - placed >= ttl {
                    state.state = ExecutionState::Canceling;
                    state.cancel_issued_at_ms = Some(now_ms);
                    return Some(CancelRequest {
                        symbol: symbol.to_string(),
                        side,
                        order_id: state.current_order_id.clone(),
                        client_id: state.current_client_id.clone(),
                        is_algo: false,
                    });
                }
                None
            }
            ExecutionState::Canceling => {
                let issued = state.cancel_issued_at_ms?;
                if now_ms - issued >= cancel_timeout_ms {
                    info!(symbol, side = %side, "cancel ack grace elapsed, moving to cooldown");
                    state.state = ExecutionState::Cooldown;
                    state.cooldown_until_ms = Some(now_ms + self.config.repost_cooldown_ms as i64);
                }
                None
            }
            ExecutionState::Cooldown => {
                if now_ms >= state.cooldown_until_ms.unwrap_or(0) {
                    state.state = ExecutionState::Idle;
                }
                None
            }
            ExecutionState::Idle | ExecutionState::Placing => None,
        }
    }

    /// A cancel ack arrived (as a direct REST response rather than a
    /// websocket update) while `CANCELING` — arm cooldown.
    pub fn on_cancel_ack(&mut self, symbol: &str, side: Side, now_ms: i64) {
        let repost_cooldown_ms = self.config.repost_cooldown_ms as i64;
        if let Some(state) = self.states.get_mut(&(symbol.to_string(), side)) {
            if state.state == ExecutionState::Canceling {
                state.state = ExecutionState::Cooldown;
                state.cooldown_until_ms = Some(now_ms + repost_cooldown_ms);
            }
        }
    }

    /// Position reached zero: recycle the side state and, if a live order
    /// exists, request its cancellation.
    pub fn on_position_zero(&mut self, symbol: &str, side: Side) -> Option<CancelRequest> {
        let state = self.states.get_mut(&(symbol.to_string(), side))?;
        let live = matches!(
            state.state,
            ExecutionState::Placing | ExecutionState::Waiting | ExecutionState::Canceling
        );
        let cancel = live.then(|| CancelRequest {
            symbol: symbol.to_string(),
            side,
            order_id: state.current_order_id.clone(),
            client_id: state.current_client_id.clone(),
            is_algo: false,
        });
        state.recycle();
        cancel
    }
}

/// Derive `effective_maker_timeouts_to_escalate` from the configured base,
/// bounded to `[base, base * 4]`: a side whose maker orders rarely get
/// filled is pulled toward the floor (escalates quickly), a side with a
/// healthy fill ratio is allowed up to `base * 4` timeouts before
/// escalating.
fn effective_maker_timeouts_to_escalate(base: u32, fill_ratio: f64) -> u32 {
    let scaled = base as f64 * (1.0 + 3.0 * fill_ratio.clamp(0.0, 1.0));
    scaled.round().clamp(base as f64, base.saturating_mul(4) as f64) as u32
}

fn record_terminal_fill(state: &mut SideExecutionState, is_maker: bool) {
    if is_maker {
        state.maker_fills += 1;
    } else {
        state.aggr_fill_count += 1;
    }
}

fn evaluate_mode_rotation(state: &mut SideExecutionState, config: &ExecutionConfig) {
    match state.mode {
        Mode::MakerOnly => {
            let base = state.escalate_override.unwrap_or(config.base_maker_timeouts_to_escalate);
            let threshold = effective_maker_timeouts_to_escalate(base, state.maker_fill_ratio());
            if state.maker_timeout_count >= threshold {
                state.mode = Mode::AggressiveLimit;
                state.reset_timeout_counters();
            }
        }
        Mode::AggressiveLimit => {
            if state.aggr_fill_count >= config.aggr_fills_to_deescalate
                || state.aggr_timeout_count >= config.aggr_timeouts_to_deescalate
            {
                state.mode = Mode::MakerOnly;
                state.reset_timeout_counters();
            }
        }
    }
    if state.force_aggressive {
        state.mode = Mode::AggressiveLimit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::PricingMode;
    use common::Side;
    use rust_decimal_macros::dec;

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            maker_order_ttl_ms: 800,
            aggr_order_ttl_ms: 500,
            cancel_timeout_ms: 1000,
            repost_cooldown_ms: 300,
            maker_safety_ticks: 1,
            maker_pricing: PricingMode::AtTouch,
            base_maker_timeouts_to_escalate: 2,
            aggr_fills_to_deescalate: 1,
            aggr_timeouts_to_deescalate: 3,
            base_lot_mult: dec!(1),
            max_mult: dec!(5),
            max_order_notional: dec!(1000),
        }
    }

    fn rules() -> InstrumentRules {
        InstrumentRules::new("BTCUSDT", dec!(0.01), dec!(0.001), dec!(0.001), dec!(5), 10)
    }

    fn snap() -> MarketSnapshot {
        let mut s = MarketSnapshot::new("BTCUSDT");
        s.best_bid = Some(dec!(199.98));
        s.best_ask = Some(dec!(200.00));
        s.last_trade_price = Some(dec!(200.00));
        s.previous_trade_price = Some(dec!(199.99));
        s
    }

    fn pos(side: Side, amt: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side,
            position_amt: amt,
            entry_price: dec!(200),
            mark_price: dec!(200),
            liquidation_price: dec!(150),
            unrealized_pnl: dec!(0),
        }
    }

    fn signal(side: Side) -> ExitSignal {
        ExitSignal {
            symbol: "BTCUSDT".into(),
            side,
            reason: common::ExitReason::LongPrimary,
            roi_mult: dec!(1),
            accel_mult: dec!(1),
            at: chrono::DateTime::<chrono::Utc>::from_timestamp_millis(0).unwrap(),
        }
    }

    #[test]
    fn idle_to_placing_on_signal_then_waiting_on_ack() {
        let mut eng = ExecutionEngine::new(config(), "run1", "liq");
        let intent = eng
            .submit_for_signal(&signal(Side::Long), &pos(Side::Long, dec!(10.0)), &rules(), &snap(), 0)
            .expect("expected an intent");
        assert!(intent.reduce_only);
        assert_eq!(eng.state("BTCUSDT", Side::Long).unwrap().state, ExecutionState::Placing);

        eng.confirm_submitted("BTCUSDT", Side::Long, "venue-1".into(), 10);
        assert_eq!(eng.state("BTCUSDT", Side::Long).unwrap().state, ExecutionState::Waiting);
    }

    #[test]
    fn busy_side_wastes_a_second_signal() {
        let mut eng = ExecutionEngine::new(config(), "run1", "liq");
        eng.submit_for_signal(&signal(Side::Long), &pos(Side::Long, dec!(10.0)), &rules(), &snap(), 0)
            .unwrap();
        let second = eng.submit_for_signal(&signal(Side::Long), &pos(Side::Long, dec!(10.0)), &rules(), &snap(), 1);
        assert!(second.is_none());
    }

    #[test]
    fn ttl_elapses_to_canceling_then_cooldown_then_idle() {
        let mut eng = ExecutionEngine::new(config(), "run1", "liq");
        eng.submit_for_signal(&signal(Side::Long), &pos(Side::Long, dec!(10.0)), &rules(), &snap(), 0)
            .unwrap();
        eng.confirm_submitted("BTCUSDT", Side::Long, "venue-1".into(), 0);

        // Before TTL: no cancel.
        assert!(eng.tick("BTCUSDT", Side::Long, 100).is_none());
        // TTL elapsed (800ms maker ttl).
        let cancel = eng.tick("BTCUSDT", Side::Long, 900).expect("expected cancel");
        assert_eq!(cancel.order_id.as_deref(), Some("venue-1"));
        assert_eq!(eng.state("BTCUSDT", Side::Long).unwrap().state, ExecutionState::Canceling);

        // Cancel ack grace elapses without an ack -> COOLDOWN, order_id retained.
        eng.tick("BTCUSDT", Side::Long, 900 + 1000);
        let s = eng.state("BTCUSDT", Side::Long).unwrap();
        assert_eq!(s.state, ExecutionState::Cooldown);
        assert_eq!(s.current_order_id.as_deref(), Some("venue-1"));

        // Cooldown elapses -> IDLE.
        eng.tick("BTCUSDT", Side::Long, 900 + 1000 + 300);
        assert_eq!(eng.state("BTCUSDT", Side::Long).unwrap().state, ExecutionState::Idle);
    }

    #[test]
    fn late_cancel_ack_after_cooldown_path_is_tolerated() {
        let mut eng = ExecutionEngine::new(config(), "run1", "liq");
        eng.submit_for_signal(&signal(Side::Long), &pos(Side::Long, dec!(10.0)), &rules(), &snap(), 0)
            .unwrap();
        eng.confirm_submitted("BTCUSDT", Side::Long, "venue-1".into(), 0);
        eng.tick("BTCUSDT", Side::Long, 900); // -> CANCELING
        eng.tick("BTCUSDT", Side::Long, 1900); // grace elapses -> COOLDOWN

        let late_update = OrderUpdate {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            order_id: "venue-1".into(),
            client_id: "whatever".into(),
            status: OrderStatus::Canceled,
            order_type: OrderType::Limit,
            reduce_only: true,
            close_position: false,
            is_maker: true,
            filled_qty: dec!(0),
            avg_price: None,
            realized_pnl: dec!(0),
            fee: dec!(0),
        };
        // Must not panic or deadlock the side — it's already past this update.
        eng.on_order_update(&late_update, 2000);
        assert_eq!(eng.state("BTCUSDT", Side::Long).unwrap().state, ExecutionState::Cooldown);
    }

    #[test]
    fn escalates_to_aggressive_after_enough_post_only_rejects() {
        let mut eng = ExecutionEngine::new(config(), "run1", "liq");
        // A side whose maker orders never fill should escalate to
        // AGGRESSIVE_LIMIT well within the base*4 ceiling (base=2 -> 8).
        for i in 0..8 {
            eng.submit_for_signal(&signal(Side::Long), &pos(Side::Long, dec!(10.0)), &rules(), &snap(), i)
                .expect("side is idle between rejects, submission should succeed");
            eng.reject_submission("BTCUSDT", Side::Long, ErrorKind::PostOnlyReject);
            if eng.state("BTCUSDT", Side::Long).unwrap().mode == Mode::AggressiveLimit {
                return;
            }
        }
        panic!("side never escalated to AGGRESSIVE_LIMIT after 8 straight post-only rejects");
    }

    #[test]
    fn position_zero_cancels_live_order_and_recycles() {
        let mut eng = ExecutionEngine::new(config(), "run1", "liq");
        eng.submit_for_signal(&signal(Side::Long), &pos(Side::Long, dec!(10.0)), &rules(), &snap(), 0)
            .unwrap();
        eng.confirm_submitted("BTCUSDT", Side::Long, "venue-1".into(), 0);

        let cancel = eng.on_position_zero("BTCUSDT", Side::Long).expect("expected a cancel");
        assert_eq!(cancel.order_id.as_deref(), Some("venue-1"));
        assert_eq!(eng.state("BTCUSDT", Side::Long).unwrap().state, ExecutionState::Idle);
    }

    #[test]
    fn shutdown_never_touches_a_foreign_client_id() {
        let eng = ExecutionEngine::new(config(), "run1", "liq");
        assert!(eng.is_own_client_id(&format!("{}1-0", eng.run_prefix())));
        assert!(!eng.is_own_client_id("someone-elses-order-42"));
    }
}
