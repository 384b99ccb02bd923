//! The main loop: the single task that owns every piece of core state and
//! drives it from market events, user-data events, and a periodic timer.
//! Per the concurrency model, nothing here ever touches `SideExecutionState`
//! across an `.await` point without re-reading it afterward.

pub mod recalibration;
pub mod shutdown;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::config::Config;
use common::{ErrorKind, InstrumentRules, OrderIntent, Position, Side};
use execution::ExecutionEngine;
use exchange::{ExchangeRest, MarketEvent, UserEvent};
use ratelimit::{ActionKind, RateLimiter};
use risk::{ExternalOrderDecision, RiskSupervisor, SyncTrigger};
use signal::SignalEngine;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use recalibration::RecalibrationReport;
pub use shutdown::{wait_for_signal, ShutdownController};

const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Reconstructs the stable client id the risk supervisor uses for a side's
/// protective stop, without needing a public accessor into `RiskSupervisor`
/// — the format is part of the contract between the two crates, not a
/// private implementation detail.
fn stable_stop_client_id(stable_prefix: &str, symbol: &str, side: Side) -> String {
    format!("{stable_prefix}-{symbol}-{side}")
}

pub struct Orchestrator {
    rest: Arc<dyn ExchangeRest>,
    config: Config,
    rules: HashMap<String, Arc<InstrumentRules>>,
    positions: HashMap<(String, Side), Position>,
    signal: SignalEngine,
    execution: ExecutionEngine,
    risk: RiskSupervisor,
    rate_limiter: RateLimiter,
    recalibrating: bool,
}

impl Orchestrator {
    pub fn new(config: Config, rest: Arc<dyn ExchangeRest>, run_id: impl Into<String>) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limiter.max_orders_per_sec, config.rate_limiter.max_cancels_per_sec);
        let signal = SignalEngine::new(config.signal.clone());
        let execution = ExecutionEngine::new(config.execution.clone(), run_id, config.run.client_id_prefix.clone());
        let risk = RiskSupervisor::new(config.risk.clone());
        Self {
            rest,
            config,
            rules: HashMap::new(),
            positions: HashMap::new(),
            signal,
            execution,
            risk,
            rate_limiter,
            recalibrating: false,
        }
    }

    /// Initial load before the main loop starts: instrument rules,
    /// positions, leverage, and a startup protective-stop sync. A failure
    /// here is `fatal_config`-adjacent — the caller should abort rather
    /// than enter `run`.
    pub async fn bootstrap(&mut self) -> common::Result<()> {
        for symbol in self.config.symbols.clone() {
            let rules = self.rest.fetch_instrument_rules(&symbol).await?;
            self.rules.insert(symbol, Arc::new(rules));
        }
        self.positions = self.rest.fetch_positions().await?;
        if let Ok(leverage_map) = self.rest.fetch_leverage_map().await {
            for (symbol, leverage) in leverage_map {
                if let Some(rules) = self.rules.get(&symbol) {
                    rules.set_leverage(leverage);
                }
            }
        }
        let now_ms = Utc::now().timestamp_millis();
        for (symbol, side) in self.positions.keys().cloned().collect::<Vec<_>>() {
            self.risk.schedule_stop_sync(&symbol, side, SyncTrigger::Startup, now_ms);
        }
        info!(symbols = self.rules.len(), positions = self.positions.len(), "bootstrap complete");
        Ok(())
    }

    /// Drives the main loop until `shutdown.triggered()` resolves, then
    /// runs the shutdown sequence and returns.
    pub async fn run(
        mut self,
        mut market_rx: broadcast::Receiver<MarketEvent>,
        mut user_rx: broadcast::Receiver<UserEvent>,
        shutdown: ShutdownController,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = market_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_market_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "market event receiver lagged"),
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("market event stream closed, entering recalibration");
                            self.recalibrate(SyncTrigger::Recalibration).await;
                        }
                    }
                }
                event = user_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_user_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "user event receiver lagged"),
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("user event stream closed, entering recalibration");
                            self.recalibrate(SyncTrigger::Recalibration).await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.handle_timer().await;
                }
                _ = shutdown.triggered() => {
                    info!("shutdown requested, cancelling own open orders");
                    self.shutdown_cancel_own_orders().await;
                    return;
                }
            }
        }
    }

    // ─── Market data ────────────────────────────────────────────────────

    async fn handle_market_event(&mut self, event: MarketEvent) {
        match event {
            MarketEvent::Quote { symbol, best_bid, best_ask, at } => {
                self.signal.on_quote(&symbol, best_bid, best_ask, at);
            }
            MarketEvent::Trade { symbol, price, at } => {
                self.signal.on_trade(&symbol, price, at);
            }
            MarketEvent::Mark { symbol, mark_price, at } => {
                self.signal.on_mark(&symbol, mark_price, at);
                self.handle_mark_update(&symbol, mark_price, at.timestamp_millis()).await;
            }
            MarketEvent::Reconnected => {
                warn!("market data stream reconnected, entering recalibration");
                self.recalibrate(SyncTrigger::Recalibration).await;
            }
        }
    }

    async fn handle_mark_update(&mut self, symbol: &str, mark_price: rust_decimal::Decimal, now_ms: i64) {
        if self.recalibrating {
            return;
        }
        for side in [Side::Long, Side::Short] {
            let key = (symbol.to_string(), side);
            let Some(mut position) = self.positions.get(&key).cloned() else { continue };
            position.mark_price = mark_price;
            let Some(rules) = self.rules.get(symbol).cloned() else { continue };
            let Some(snapshot) = self.signal.snapshot(symbol).cloned() else { continue };

            if let Some(intent) = self.risk.on_mark_update(symbol, side, &position, &rules, &snapshot, &mut self.execution, now_ms) {
                // Risk intents bypass the rate limiter by construction.
                self.rate_limiter.observe_risk();
                self.submit_order(intent, now_ms).await;
            }
            if let Some(pos) = self.positions.get_mut(&key) {
                pos.mark_price = mark_price;
            }
        }
    }

    // ─── User data ──────────────────────────────────────────────────────

    async fn handle_user_event(&mut self, event: UserEvent) {
        let now_ms = Utc::now().timestamp_millis();
        match event {
            UserEvent::Order(update) => {
                self.execution.on_order_update(&update, now_ms);
                if !self.execution.is_own_client_id(&update.client_id) && !self.risk.is_own_stop(&update.client_id) {
                    if let Some(position) = self.positions.get(&(update.symbol.clone(), update.side)).cloned() {
                        let decision = self.risk.on_external_order_observed(
                            &update.symbol,
                            update.side,
                            update.reduce_only,
                            update.close_position,
                            None,
                            &position,
                        );
                        self.apply_external_decision(&update.symbol, update.side, decision, None, None).await;
                    }
                }
            }
            UserEvent::Algo(update) => {
                if !self.risk.is_own_stop(&update.client_id) {
                    if let Some(position) = self.positions.get(&(update.symbol.clone(), update.side)).cloned() {
                        let decision = self.risk.on_external_order_observed(
                            &update.symbol,
                            update.side,
                            update.reduce_only,
                            update.close_position,
                            update.stop_price,
                            &position,
                        );
                        self.apply_external_decision(
                            &update.symbol,
                            update.side,
                            decision,
                            Some(update.algo_id.clone()),
                            Some(update.client_id.clone()),
                        )
                        .await;
                    }
                }
            }
            UserEvent::PositionUpdate(position) => {
                let key = (position.symbol.clone(), position.side);
                self.positions.insert(key.clone(), position);
                self.risk.schedule_stop_sync(&key.0, key.1, SyncTrigger::PositionUpdate, now_ms);
            }
            UserEvent::PositionClosed { symbol, side } => {
                self.positions.remove(&(symbol.clone(), side));
                self.signal.reset_throttle(&symbol, side);
                if let Some(cancel) = self.execution.on_position_zero(&symbol, side) {
                    self.issue_cancel(cancel).await;
                }
                if let Some(stop_cancel) = self.risk.on_position_zero(&symbol, side) {
                    let _ = self.rest.cancel_any(None, Some(&stop_cancel.client_id)).await;
                }
            }
            UserEvent::LeverageChanged { symbol, leverage } => {
                if let Some(rules) = self.rules.get(&symbol) {
                    rules.set_leverage(leverage);
                }
            }
            UserEvent::SessionExpired => {
                self.recalibrate(SyncTrigger::Recalibration).await;
            }
            UserEvent::Reconnected => {
                warn!("user data stream reconnected, entering recalibration");
                self.recalibrate(SyncTrigger::Recalibration).await;
            }
        }
    }

    async fn apply_external_decision(
        &mut self,
        symbol: &str,
        side: Side,
        decision: ExternalOrderDecision,
        external_order_id: Option<String>,
        external_client_id: Option<String>,
    ) {
        match decision {
            ExternalOrderDecision::NoAction => {}
            ExternalOrderDecision::CancelOwnAndLatch => {
                let own_client_id = stable_stop_client_id(&self.config.risk.protective_stop.stable_prefix, symbol, side);
                let _ = self.rest.cancel_any(None, Some(&own_client_id)).await;
            }
            ExternalOrderDecision::CancelExternalAndTakeOver => {
                let _ = self
                    .rest
                    .cancel_any(external_order_id.as_deref(), external_client_id.as_deref())
                    .await;
                let now_ms = Utc::now().timestamp_millis();
                self.risk.schedule_stop_sync(symbol, side, SyncTrigger::Default, now_ms);
            }
        }
    }

    // ─── Timer ──────────────────────────────────────────────────────────

    async fn handle_timer(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        if self.recalibrating {
            return;
        }

        for (symbol, side) in self.positions.keys().cloned().collect::<Vec<_>>() {
            if let Some(cancel) = self.execution.tick(&symbol, side, now_ms) {
                self.issue_cancel(cancel).await;
            }

            self.try_signal_submit(&symbol, side, now_ms).await;

            let Some(rules) = self.rules.get(&symbol).cloned() else { continue };
            if let Some(position) = self.positions.get(&(symbol.clone(), side)).cloned() {
                if let Some(intent) = self.risk.evaluate_protective_stop(&symbol, side, &position, &rules, now_ms) {
                    self.submit_protective_stop(&symbol, side, intent).await;
                }
            }
        }
    }

    async fn try_signal_submit(&mut self, symbol: &str, side: Side, now_ms: i64) {
        let Some(position) = self.positions.get(&(symbol.to_string(), side)).cloned() else { return };
        let Some(rules) = self.rules.get(symbol).cloned() else { return };
        let leverage = rules.leverage();
        let Some(signal) = self.signal.evaluate(symbol, side, &position, leverage, Utc::now()) else { return };
        let Some(snapshot) = self.signal.snapshot(symbol).cloned() else { return };

        if !self.rate_limiter.try_admit(ActionKind::Submit, Utc::now()) {
            debug!(symbol, side = %side, "submit denied by rate limiter");
            return;
        }

        let Some(intent) = self.execution.submit_for_signal(&signal, &position, &rules, &snapshot, now_ms) else { return };
        let retry_kind = self.submit_order(intent, now_ms).await;

        // post_only_reject gets exactly one retry, repriced at
        // AGGRESSIVE_LIMIT so it doesn't just reproduce the same
        // rejection; duplicate_client_id gets exactly one retry with a
        // freshly generated client id at the side's normal mode.
        let retry_intent = match retry_kind {
            Some(ErrorKind::PostOnlyReject) => {
                self.execution.retry_with_aggressive_pricing(&signal, &position, &rules, &snapshot, now_ms)
            }
            Some(ErrorKind::DuplicateClientId) => {
                self.execution.submit_for_signal(&signal, &position, &rules, &snapshot, now_ms)
            }
            _ => None,
        };
        if let Some(intent) = retry_intent {
            self.submit_order(intent, now_ms).await;
        }
    }

    /// Submits `intent`, reconciling the execution engine with the result.
    /// Returns `Some(kind)` if the caller should retry the same signal once
    /// — `post_only_reject` (repriced aggressive) or `duplicate_client_id`
    /// (regenerated id) — and `None` otherwise.
    async fn submit_order(&mut self, intent: OrderIntent, now_ms: i64) -> Option<ErrorKind> {
        let symbol = intent.symbol.clone();
        let side = intent.side;
        match self.rest.submit(&intent).await {
            Ok(result) if result.success => {
                if let Some(order_id) = result.order_id {
                    self.execution.confirm_submitted(&symbol, side, order_id, now_ms);
                } else {
                    warn!(symbol, side = %side, "submit reported success with no order id");
                }
                None
            }
            Ok(result) => {
                warn!(symbol, side = %side, error_code = ?result.error_code, "submit rejected by venue");
                self.execution
                    .reject_submission(&symbol, side, ErrorKind::Other)
                    .then_some(ErrorKind::Other)
            }
            Err(e) => {
                let kind = e.kind();
                match kind {
                    ErrorKind::TransientNetwork | ErrorKind::RateLimitedByVenue => {
                        warn!(symbol, side = %side, error = %e, "submit failed, will re-evaluate next tick");
                        self.execution.reject_submission(&symbol, side, kind);
                        None
                    }
                    ErrorKind::PrecisionViolation | ErrorKind::ReduceOnlyViolation => {
                        warn!(symbol, side = %side, error = %e, "submit dropped, stale snapshot assumed");
                        self.execution.reject_submission(&symbol, side, kind);
                        None
                    }
                    _ => self.execution.reject_submission(&symbol, side, kind).then_some(kind),
                }
            }
        }
    }

    async fn submit_protective_stop(&mut self, symbol: &str, side: Side, intent: OrderIntent) {
        let old_client_id = stable_stop_client_id(&self.config.risk.protective_stop.stable_prefix, symbol, side);
        // The stable client id is reused across replacements, so the prior
        // resting stop (if any) must be cancelled before resubmitting —
        // best-effort, a not-found response just means there wasn't one.
        let _ = self.rest.cancel_any(None, Some(&old_client_id)).await;
        match self.rest.submit(&intent).await {
            Ok(result) if result.success => {
                info!(symbol, side = %side, price = ?intent.price, "protective stop armed");
            }
            Ok(result) => warn!(symbol, side = %side, error_code = ?result.error_code, "protective stop submission rejected"),
            Err(e) if e.kind() == ErrorKind::ExternalConflict => {
                warn!(symbol, side = %side, "protective stop conflicted with an external order, latch engaged");
            }
            Err(e) => warn!(symbol, side = %side, error = %e, "protective stop submission failed"),
        }
    }

    async fn issue_cancel(&mut self, cancel: execution::CancelRequest) {
        if !self.rate_limiter.try_admit(ActionKind::Cancel, Utc::now()) {
            // A cancel that can't be admitted this window will be
            // re-attempted on the next tick's TTL check.
            return;
        }
        let result = self.rest.cancel_any(cancel.order_id.as_deref(), cancel.client_id.as_deref()).await;
        let now_ms = Utc::now().timestamp_millis();
        match result {
            Ok(r) if r.success => self.execution.on_cancel_ack(&cancel.symbol, cancel.side, now_ms),
            Ok(_) => {}
            Err(e) => warn!(symbol = %cancel.symbol, side = %cancel.side, error = %e, "cancel failed"),
        }
    }

    // ─── Recalibration ──────────────────────────────────────────────────

    /// Re-fetches rules, positions, leverage, and open orders/algo orders
    /// after a reconnect. No new orders are submitted for the duration —
    /// `handle_timer` is a no-op while `self.recalibrating` is set.
    pub async fn recalibrate(&mut self, trigger: SyncTrigger) -> RecalibrationReport {
        self.recalibrating = true;
        let mut report = RecalibrationReport::default();

        for symbol in self.config.symbols.clone() {
            match self.rest.fetch_instrument_rules(&symbol).await {
                Ok(rules) => {
                    self.rules.insert(symbol, Arc::new(rules));
                    report.rules_refreshed += 1;
                }
                Err(e) => warn!(symbol, error = %e, "failed to refresh instrument rules"),
            }
        }

        match self.rest.fetch_positions().await {
            Ok(positions) => {
                report.positions_refreshed = positions.len();
                self.positions = positions;
            }
            Err(e) => warn!(error = %e, "failed to refresh positions"),
        }

        if let Ok(leverage_map) = self.rest.fetch_leverage_map().await {
            for (symbol, leverage) in leverage_map {
                if let Some(rules) = self.rules.get(&symbol) {
                    rules.set_leverage(leverage);
                }
            }
        }

        let open_orders = self.rest.fetch_open_orders(None).await.unwrap_or_default();
        let open_algo = self.rest.fetch_open_algo_orders(None).await.unwrap_or_default();
        report.open_orders_seen = open_orders.len();
        report.open_algo_orders_seen = open_algo.len();

        let mut external_seen: std::collections::HashSet<(String, Side)> = std::collections::HashSet::new();
        for o in &open_orders {
            if self.execution.is_own_client_id(&o.client_id) || self.risk.is_own_stop(&o.client_id) {
                continue;
            }
            if let Some(position) = self.positions.get(&(o.symbol.clone(), o.side)).cloned() {
                let decision = self.risk.on_external_order_observed(&o.symbol, o.side, o.reduce_only, o.close_position, None, &position);
                if decision != ExternalOrderDecision::NoAction {
                    external_seen.insert((o.symbol.clone(), o.side));
                    report.external_orders_handled += 1;
                }
                self.apply_external_decision(&o.symbol, o.side, decision, Some(o.order_id.clone()), Some(o.client_id.clone())).await;
            }
        }
        for a in &open_algo {
            if self.risk.is_own_stop(&a.client_id) {
                continue;
            }
            if let Some(position) = self.positions.get(&(a.symbol.clone(), a.side)).cloned() {
                let decision = self.risk.on_external_order_observed(&a.symbol, a.side, a.reduce_only, a.close_position, a.stop_price, &position);
                if decision != ExternalOrderDecision::NoAction {
                    external_seen.insert((a.symbol.clone(), a.side));
                    report.external_orders_handled += 1;
                }
                self.apply_external_decision(&a.symbol, a.side, decision, Some(a.algo_id.clone()), Some(a.client_id.clone())).await;
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        for (symbol, side) in self.positions.keys().cloned().collect::<Vec<_>>() {
            if !external_seen.contains(&(symbol.clone(), side)) {
                self.risk.release_latch_if_clear(&symbol, side, now_ms);
            }
        }

        self.recalibrating = false;
        for (symbol, side) in self.positions.keys().cloned().collect::<Vec<_>>() {
            self.risk.schedule_stop_sync(&symbol, side, trigger, now_ms);
        }
        info!(?report, "recalibration complete");
        report
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    async fn shutdown_cancel_own_orders(&mut self) {
        let keys: Vec<(String, Side)> = self.positions.keys().cloned().collect();
        let mut cancels = Vec::new();
        for (symbol, side) in keys {
            if let Some(state) = self.execution.state(&symbol, side) {
                if let (Some(client_id), true) = (state.current_client_id.clone(), state.current_order_id.is_some()) {
                    cancels.push(self.rest.cancel_any(state.current_order_id.as_deref(), Some(&client_id)));
                }
            }
        }
        let collective = futures_util::future::join_all(cancels);
        match tokio::time::timeout(Duration::from_secs(5), collective).await {
            Ok(results) => {
                let failed = results.iter().filter(|r| r.as_ref().map(|o| !o.success).unwrap_or(true)).count();
                if failed > 0 {
                    warn!(failed, "some own orders could not be confirmed cancelled during shutdown");
                }
            }
            Err(_) => warn!("shutdown cancel collective timed out after 5s"),
        }
    }
}
