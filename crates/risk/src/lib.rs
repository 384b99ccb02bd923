//! Three-tier risk supervisor: soft de-risk, panic sliced close, and the
//! exchange-resident protective stop. Reaches into the execution engine only
//! through the `force_aggressive` flag and by submitting its own intents —
//! never a direct state mutation, so there is no cycle back from execution.

mod tiers;

use std::collections::HashMap;

use common::config::{ProtectiveStopConfig, RiskConfig};
use common::{InstrumentRules, MarketSnapshot, OrderDirection, OrderIntent, Position, Side};
use execution::ExecutionEngine;
use rust_decimal::Decimal;
use tracing::{info, warn};

pub use tiers::{external_stop_is_valid, is_stricter, protective_stop_price, select_panic_tier, soft_derisk_active};

/// When a protective-stop sync was requested, governing how long the
/// supervisor waits before acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Recalibration,
    Default,
    PositionUpdate,
}

/// What the caller should do after observing an external reduce-only order
/// on a side the supervisor is protecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalOrderDecision {
    /// No reduce-only/close-position order was observed; nothing to do.
    NoAction,
    /// A valid external stop/tp is present: cancel our own stop and latch.
    CancelOwnAndLatch,
    /// The external stop is on the wrong side of the liquidation price:
    /// cancel it and proceed to take over instead of latching.
    CancelExternalAndTakeOver,
}

/// A cancellation the supervisor wants issued for its own protective stop.
#[derive(Debug, Clone)]
pub struct StopCancelRequest {
    pub symbol: String,
    pub side: Side,
    pub client_id: String,
}

#[derive(Debug, Clone, Default)]
struct ProtectiveStopState {
    client_id: Option<String>,
    stop_price: Option<Decimal>,
    takeover_latch: bool,
    sync_due_at_ms: Option<i64>,
}

pub struct RiskSupervisor {
    config: RiskConfig,
    derisk_active: HashMap<(String, Side), bool>,
    stops: HashMap<(String, Side), ProtectiveStopState>,
}

impl RiskSupervisor {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            derisk_active: HashMap::new(),
            stops: HashMap::new(),
        }
    }

    fn direction_for(side: Side) -> OrderDirection {
        match side {
            Side::Long => OrderDirection::Sell,
            Side::Short => OrderDirection::Buy,
        }
    }

    fn stable_client_id(&self, symbol: &str, side: Side) -> String {
        format!("{}-{symbol}-{side}", self.config.protective_stop.stable_prefix)
    }

    /// Whether `client_id` belongs to one of this supervisor's own
    /// protective stops, recognizable across process restarts because it
    /// carries the stable prefix rather than a run-id.
    pub fn is_own_stop(&self, client_id: &str) -> bool {
        client_id.starts_with(&self.config.protective_stop.stable_prefix)
    }

    /// Tier 1 (sticky force-aggressive flag) and tier 2 (panic sliced
    /// close) both key off a fresh mark-price sample. Returns a panic
    /// order intent if the most-dangerous satisfied tier calls for one;
    /// the caller must bypass the rate limiter for it (`is_risk = true`
    /// is already set on the returned intent).
    #[allow(clippy::too_many_arguments)]
    pub fn on_mark_update(
        &mut self,
        symbol: &str,
        side: Side,
        position: &Position,
        rules: &InstrumentRules,
        snapshot: &MarketSnapshot,
        execution: &mut ExecutionEngine,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        let d = position.distance_to_liquidation()?;
        let key = (symbol.to_string(), side);

        let currently_active = self.derisk_active.get(&key).copied().unwrap_or(false);
        let active = soft_derisk_active(
            d,
            self.config.liq_distance_threshold,
            self.config.hysteresis_margin,
            currently_active,
        );
        if active != currently_active {
            info!(symbol, side = %side, d = %d, active, "tier-1 soft de-risk flag changed");
        }
        self.derisk_active.insert(key, active);
        execution.set_force_aggressive(symbol, side, active);

        let tier = select_panic_tier(d, &self.config.panic_close.tiers)?;
        warn!(symbol, side = %side, d = %d, d_threshold = %tier.d_threshold, "panic close tier triggered");
        execution.submit_for_panic(symbol, side, tier, position, rules, snapshot, now_ms)
    }

    /// Request a protective-stop reconciliation pass for `(symbol, side)`,
    /// debounced per the trigger that caused it. Startup and recalibration
    /// are effectively immediate; most events get the default debounce;
    /// position updates get a longer one.
    pub fn schedule_stop_sync(&mut self, symbol: &str, side: Side, trigger: SyncTrigger, now_ms: i64) {
        let debounce = self.debounce_ms(trigger);
        let stop = self.stops.entry((symbol.to_string(), side)).or_default();
        let due = now_ms + debounce;
        stop.sync_due_at_ms = Some(stop.sync_due_at_ms.map_or(due, |existing| existing.min(due)));
    }

    fn debounce_ms(&self, trigger: SyncTrigger) -> i64 {
        let cfg: &ProtectiveStopConfig = &self.config.protective_stop;
        match trigger {
            SyncTrigger::Startup | SyncTrigger::Recalibration => cfg.debounce_startup_ms,
            SyncTrigger::Default => cfg.debounce_default_ms,
            SyncTrigger::PositionUpdate => cfg.debounce_position_update_ms,
        }
    }

    /// Tier 3: if a sync is due, the side isn't latched by an external
    /// takeover, and a strictly safer stop price is available, returns the
    /// replacement intent. Monotone — never returns a less-safe stop.
    pub fn evaluate_protective_stop(
        &mut self,
        symbol: &str,
        side: Side,
        position: &Position,
        rules: &InstrumentRules,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        if !self.config.protective_stop.enabled || position.is_zero() {
            return None;
        }
        let key = (symbol.to_string(), side);
        let due = match self.stops.get(&key).and_then(|s| s.sync_due_at_ms) {
            Some(t) => now_ms >= t,
            None => false,
        };
        if !due {
            return None;
        }

        let stop = self.stops.entry(key).or_default();
        if stop.takeover_latch {
            stop.sync_due_at_ms = None;
            return None;
        }

        let candidate = protective_stop_price(
            side,
            position.liquidation_price,
            self.config.protective_stop.dist_to_liq,
            rules.tick_size,
        );
        let replace = match stop.stop_price {
            None => true,
            Some(current) => is_stricter(side, candidate, current),
        };
        stop.sync_due_at_ms = None;
        if !replace {
            return None;
        }

        let client_id = self.stable_client_id(symbol, side);
        stop.stop_price = Some(candidate);
        stop.client_id = Some(client_id.clone());
        info!(symbol, side = %side, stop_price = %candidate, "replacing protective stop");
        Some(OrderIntent::protective_stop(symbol, Self::direction_for(side), side, candidate, client_id))
    }

    /// Observed a live reduce-only or close-position order on `side` that
    /// isn't one of ours (caller already filtered by client-id ownership).
    pub fn on_external_order_observed(
        &mut self,
        symbol: &str,
        side: Side,
        reduce_only: bool,
        close_position: bool,
        stop_price: Option<Decimal>,
        position: &Position,
    ) -> ExternalOrderDecision {
        if !reduce_only && !close_position {
            return ExternalOrderDecision::NoAction;
        }
        let valid = external_stop_is_valid(
            side,
            stop_price,
            position.liquidation_price,
            self.config.protective_stop.external_conflict_tolerance,
        );
        let stop = self.stops.entry((symbol.to_string(), side)).or_default();
        if valid {
            stop.takeover_latch = true;
            stop.stop_price = None;
            stop.client_id = None;
            warn!(symbol, side = %side, "external protective order detected, latching");
            ExternalOrderDecision::CancelOwnAndLatch
        } else {
            warn!(symbol, side = %side, "external protective order invalid, taking over");
            ExternalOrderDecision::CancelExternalAndTakeOver
        }
    }

    /// A REST-verified pass found no external reduce-only/close-position
    /// order remaining on this side: release the takeover latch and
    /// schedule an immediate resync. Websocket terminal events for the
    /// external order are never sufficient on their own to reach this call.
    pub fn release_latch_if_clear(&mut self, symbol: &str, side: Side, now_ms: i64) -> bool {
        let key = (symbol.to_string(), side);
        let was_latched = match self.stops.get(&key) {
            Some(s) => s.takeover_latch,
            None => false,
        };
        if !was_latched {
            return false;
        }
        self.stops.entry(key).or_default().takeover_latch = false;
        self.schedule_stop_sync(symbol, side, SyncTrigger::Recalibration, now_ms);
        info!(symbol, side = %side, "external takeover latch released");
        true
    }

    /// Position reached zero: unconditionally cancel our own protective
    /// stop for this side so a later trigger can't re-open it.
    pub fn on_position_zero(&mut self, symbol: &str, side: Side) -> Option<StopCancelRequest> {
        let key = (symbol.to_string(), side);
        let stop = self.stops.remove(&key)?;
        self.derisk_active.remove(&key);
        stop.client_id.map(|client_id| StopCancelRequest {
            symbol: symbol.to_string(),
            side,
            client_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{ExecutionConfig, PanicCloseConfig, PanicCloseTier, PricingMode};
    use rust_decimal_macros::dec;

    fn risk_config() -> RiskConfig {
        RiskConfig {
            liq_distance_threshold: dec!(0.05),
            hysteresis_margin: dec!(0.01),
            panic_close: PanicCloseConfig {
                tiers: vec![
                    PanicCloseTier { d_threshold: dec!(0.012), slice_ratio: dec!(0.1), ttl_percent: dec!(0.5), maker_timeouts_to_escalate: 2 },
                    PanicCloseTier { d_threshold: dec!(0.008), slice_ratio: dec!(0.25), ttl_percent: dec!(0.5), maker_timeouts_to_escalate: 2 },
                ],
            },
            protective_stop: ProtectiveStopConfig {
                enabled: true,
                dist_to_liq: dec!(0.01),
                debounce_startup_ms: 0,
                debounce_default_ms: 200,
                debounce_position_update_ms: 1000,
                external_conflict_tolerance: dec!(0.0001),
                stable_prefix: "liq-stop".into(),
            },
        }
    }

    fn exec_config() -> ExecutionConfig {
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

    fn long_pos(liq: Decimal, mark: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            position_amt: dec!(10.0),
            entry_price: dec!(200),
            mark_price: mark,
            liquidation_price: liq,
            unrealized_pnl: dec!(0),
        }
    }

    #[test]
    fn s5_panic_close_submits_a_risk_intent_bypassing_idle_check() {
        let mut risk = RiskSupervisor::new(risk_config());
        let mut exec = ExecutionEngine::new(exec_config(), "run1", "liq");
        // mark=200, liquidation chosen so d = |200-198.2|/200 = 0.009.
        let pos = long_pos(dec!(198.2), dec!(200));
        let intent = risk
            .on_mark_update("BTCUSDT", Side::Long, &pos, &rules(), &snap(), &mut exec, 0)
            .expect("expected a panic-close intent");
        assert!(intent.is_risk);
        assert!(intent.reduce_only);
    }

    #[test]
    fn tier1_flag_sets_force_aggressive_and_is_sticky() {
        let mut risk = RiskSupervisor::new(risk_config());
        let mut exec = ExecutionEngine::new(exec_config(), "run1", "liq");
        // d = |200-190|/200 = 0.05 = threshold -> active.
        let pos = long_pos(dec!(190), dec!(200));
        risk.on_mark_update("BTCUSDT", Side::Long, &pos, &rules(), &snap(), &mut exec, 0);
        assert!(exec.state("BTCUSDT", Side::Long).unwrap().force_aggressive);
    }

    #[test]
    fn s3_protective_stop_replaces_only_when_strictly_safer() {
        let mut risk = RiskSupervisor::new(risk_config());
        risk.schedule_stop_sync("BTCUSDT", Side::Long, SyncTrigger::Startup, 0);
        let pos1 = long_pos(dec!(150), dec!(200));
        let i1 = risk.evaluate_protective_stop("BTCUSDT", Side::Long, &pos1, &rules(), 0).unwrap();
        assert_eq!(i1.price, Some(dec!(151.52)));

        risk.schedule_stop_sync("BTCUSDT", Side::Long, SyncTrigger::Default, 0);
        let pos2 = long_pos(dec!(152), dec!(200));
        let i2 = risk.evaluate_protective_stop("BTCUSDT", Side::Long, &pos2, &rules(), 300).unwrap();
        assert_eq!(i2.price, Some(dec!(153.54)));

        // Liquidation falls back to 151: candidate 152.53 < current 153.54 -> no replacement.
        risk.schedule_stop_sync("BTCUSDT", Side::Long, SyncTrigger::Default, 300);
        let pos3 = long_pos(dec!(151), dec!(200));
        assert!(risk.evaluate_protective_stop("BTCUSDT", Side::Long, &pos3, &rules(), 600).is_none());
    }

    #[test]
    fn s4_external_takeover_and_release() {
        let mut risk = RiskSupervisor::new(risk_config());
        risk.schedule_stop_sync("BTCUSDT", Side::Long, SyncTrigger::Startup, 0);
        let pos = long_pos(dec!(150), dec!(200));
        risk.evaluate_protective_stop("BTCUSDT", Side::Long, &pos, &rules(), 0);

        let decision = risk.on_external_order_observed(
            "BTCUSDT",
            Side::Long,
            true,
            false,
            Some(dec!(151.6)),
            &pos,
        );
        assert_eq!(decision, ExternalOrderDecision::CancelOwnAndLatch);

        // While latched, due syncs are refused even if scheduled.
        risk.schedule_stop_sync("BTCUSDT", Side::Long, SyncTrigger::Default, 100);
        assert!(risk.evaluate_protective_stop("BTCUSDT", Side::Long, &pos, &rules(), 400).is_none());

        // REST verify confirms no external remains -> release and resync.
        assert!(risk.release_latch_if_clear("BTCUSDT", Side::Long, 400));
        let replaced = risk.evaluate_protective_stop("BTCUSDT", Side::Long, &pos, &rules(), 400);
        assert!(replaced.is_some());
    }

    #[test]
    fn invalid_external_stop_triggers_takeover_instead_of_latch() {
        let mut risk = RiskSupervisor::new(risk_config());
        let pos = long_pos(dec!(150), dec!(200));
        // Stop price well below liquidation for a LONG: invalid.
        let decision = risk.on_external_order_observed("BTCUSDT", Side::Long, true, false, Some(dec!(140)), &pos);
        assert_eq!(decision, ExternalOrderDecision::CancelExternalAndTakeOver);
    }

    #[test]
    fn zero_position_cancels_own_stop_and_forgets_state() {
        let mut risk = RiskSupervisor::new(risk_config());
        risk.schedule_stop_sync("BTCUSDT", Side::Long, SyncTrigger::Startup, 0);
        let pos = long_pos(dec!(150), dec!(200));
        risk.evaluate_protective_stop("BTCUSDT", Side::Long, &pos, &rules(), 0);

        let cancel = risk.on_position_zero("BTCUSDT", Side::Long).expect("expected a stop cancel");
        assert!(risk.is_own_stop(&cancel.client_id));
    }
}
