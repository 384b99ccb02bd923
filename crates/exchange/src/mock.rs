use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::{ExchangeRest, MarketDataFeed, MarketEvent, UserDataFeed, UserEvent};
use common::{
    AlgoUpdate, Error, InstrumentRules, OrderIntent, OrderResult, OrderStatus, OrderUpdate,
    Position, Result, Side,
};

/// In-memory exchange double: orders submitted through it are immediately
/// acknowledged as `NEW` and queued; tests drive fills by calling
/// [`MockExchange::fill`] / [`MockExchange::reject`] directly. No slippage
/// or latency simulation — this is for exercising the core state machines,
/// not for realistic paper trading.
#[derive(Default)]
pub struct MockExchange {
    inner: Arc<RwLock<MockState>>,
}

#[derive(Default)]
struct MockState {
    rules: HashMap<String, InstrumentRulesSnapshot>,
    positions: HashMap<(String, Side), Position>,
    leverage: HashMap<String, u32>,
    open_orders: HashMap<String, OrderUpdate>,
    open_algo: HashMap<String, AlgoUpdate>,
    next_order_id: i64,
}

struct InstrumentRulesSnapshot {
    tick_size: Decimal,
    step_size: Decimal,
    min_qty: Decimal,
    min_notional: Decimal,
    leverage: u32,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_rules(
        &self,
        symbol: impl Into<String>,
        tick_size: Decimal,
        step_size: Decimal,
        min_qty: Decimal,
        min_notional: Decimal,
        leverage: u32,
    ) {
        let symbol = symbol.into();
        self.inner.write().rules.insert(
            symbol,
            InstrumentRulesSnapshot { tick_size, step_size, min_qty, min_notional, leverage },
        );
    }

    pub fn seed_position(&self, position: Position) {
        let key = (position.symbol.clone(), position.side);
        self.inner.write().positions.insert(key, position);
    }

    /// Marks a resting order filled (fully, by default) and removes it
    /// from the open-orders book. Returns the update a real user stream
    /// would push, so the caller can feed it straight into the engine.
    pub fn fill(&self, client_id: &str, filled_qty: Decimal, avg_price: Decimal, is_maker: bool) -> Option<OrderUpdate> {
        let mut state = self.inner.write();
        let mut update = state.open_orders.remove(client_id)?;
        update.status = OrderStatus::Filled;
        update.filled_qty = filled_qty;
        update.avg_price = Some(avg_price);
        update.is_maker = is_maker;
        Some(update)
    }

    pub fn cancel_own(&self, client_id: &str) -> Option<OrderUpdate> {
        let mut state = self.inner.write();
        let mut update = state.open_orders.remove(client_id)?;
        update.status = OrderStatus::Canceled;
        Some(update)
    }
}

#[async_trait]
impl ExchangeRest for MockExchange {
    async fn fetch_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules> {
        let state = self.inner.read();
        let snap = state
            .rules
            .get(symbol)
            .ok_or_else(|| Error::Other(format!("no seeded rules for {symbol}")))?;
        Ok(InstrumentRules::new(symbol, snap.tick_size, snap.step_size, snap.min_qty, snap.min_notional, snap.leverage))
    }

    async fn fetch_positions(&self) -> Result<HashMap<(String, Side), Position>> {
        Ok(self.inner.read().positions.clone())
    }

    async fn fetch_leverage_map(&self) -> Result<HashMap<String, u32>> {
        Ok(self.inner.read().leverage.clone())
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderUpdate>> {
        let state = self.inner.read();
        Ok(state
            .open_orders
            .values()
            .filter(|o| symbol.is_none_or_eq(&o.symbol))
            .cloned()
            .collect())
    }

    async fn fetch_open_algo_orders(&self, symbol: Option<&str>) -> Result<Vec<AlgoUpdate>> {
        let state = self.inner.read();
        Ok(state
            .open_algo
            .values()
            .filter(|o| symbol.is_none_or_eq(&o.symbol))
            .cloned()
            .collect())
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let mut state = self.inner.write();
        state.next_order_id += 1;
        let order_id = state.next_order_id.to_string();

        if intent.close_position {
            state.open_algo.insert(
                intent.client_id.clone(),
                AlgoUpdate {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    algo_id: order_id.clone(),
                    client_id: intent.client_id.clone(),
                    status: OrderStatus::New,
                    order_type: intent.order_type,
                    reduce_only: intent.reduce_only,
                    close_position: intent.close_position,
                    stop_price: intent.price,
                },
            );
        } else {
            state.open_orders.insert(
                intent.client_id.clone(),
                OrderUpdate {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    order_id: order_id.clone(),
                    client_id: intent.client_id.clone(),
                    status: OrderStatus::New,
                    order_type: intent.order_type,
                    reduce_only: intent.reduce_only,
                    close_position: intent.close_position,
                    is_maker: false,
                    filled_qty: Decimal::ZERO,
                    avg_price: None,
                    realized_pnl: Decimal::ZERO,
                    fee: Decimal::ZERO,
                },
            );
        }

        Ok(OrderResult {
            success: true,
            order_id: Some(order_id),
            status: Some(OrderStatus::New),
            filled_qty: Decimal::ZERO,
            avg_price: None,
            error_code: None,
        })
    }

    async fn cancel(&self, _order_id: Option<&str>, client_id: Option<&str>, is_algo: bool) -> Result<OrderResult> {
        let mut state = self.inner.write();
        let found = if is_algo {
            client_id.and_then(|cid| state.open_algo.remove(cid)).is_some()
        } else {
            client_id.and_then(|cid| state.open_orders.remove(cid)).is_some()
        };
        if found {
            Ok(OrderResult {
                success: true,
                order_id: None,
                status: Some(OrderStatus::Canceled),
                filled_qty: Decimal::ZERO,
                avg_price: None,
                error_code: None,
            })
        } else {
            Err(Error::OrderNotFound(client_id.unwrap_or_default().to_string()))
        }
    }

    async fn cancel_any(&self, order_id: Option<&str>, client_id: Option<&str>) -> Result<OrderResult> {
        match self.cancel(order_id, client_id, false).await {
            Ok(r) => Ok(r),
            Err(_) => self.cancel(order_id, client_id, true).await,
        }
    }
}

/// A no-op feed pair for tests that don't exercise streaming directly —
/// `run` blocks forever without producing events.
pub struct MockFeed<E: Clone + Send + 'static> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> MockFeed<E> {
    pub fn new() -> (Self, broadcast::Receiver<E>) {
        let (tx, rx) = broadcast::channel(1024);
        (Self { tx }, rx)
    }

    pub fn push(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl MarketDataFeed for MockFeed<MarketEvent> {
    fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.tx.subscribe()
    }

    async fn run(self: Box<Self>) -> Result<()> {
        std::future::pending().await
    }
}

#[async_trait]
impl UserDataFeed for MockFeed<UserEvent> {
    fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }

    async fn run(self: Box<Self>) -> Result<()> {
        std::future::pending().await
    }
}

trait OptionSymbolExt {
    fn is_none_or_eq(&self, other: &str) -> bool;
}

impl OptionSymbolExt for Option<&str> {
    fn is_none_or_eq(&self, other: &str) -> bool {
        match self {
            None => true,
            Some(s) => *s == other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{OrderDirection, OrderType, TimeInForce};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn submit_then_fill_round_trips_through_the_open_orders_book() {
        let exchange = MockExchange::new();
        let intent = OrderIntent::new(
            "BTCUSDT",
            OrderDirection::Sell,
            Side::Long,
            dec!(0.01),
            Some(dec!(50000)),
            OrderType::Limit,
            TimeInForce::Gtx,
            "run-1",
            false,
            5_000,
        );
        let result = exchange.submit(&intent).await.unwrap();
        assert!(result.success);

        let open = exchange.fetch_open_orders(None).await.unwrap();
        assert_eq!(open.len(), 1);

        let update = exchange.fill("run-1", dec!(0.01), dec!(50001), true).unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        let open_after = exchange.fetch_open_orders(None).await.unwrap();
        assert!(open_after.is_empty());
    }

    #[tokio::test]
    async fn cancel_any_falls_back_to_the_algo_book() {
        let exchange = MockExchange::new();
        let stop = OrderIntent::protective_stop("BTCUSDT", OrderDirection::Sell, Side::Long, dec!(49000), "stable-stop-1");
        exchange.submit(&stop).await.unwrap();

        let result = exchange.cancel_any(None, Some("stable-stop-1")).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn cancel_any_reports_not_found_when_absent_from_both_books() {
        let exchange = MockExchange::new();
        let err = exchange.cancel_any(None, Some("nonexistent")).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::OrderNotFound);
    }
}
