use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::position::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDirection {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    StopMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good-til-cancel.
    Gtc,
    /// Post-only ("good-til-crossing" on Binance).
    Gtx,
}

/// An order the core wants submitted. Every intent emitted by this system
/// has `reduce_only = true` — that invariant is enforced at construction,
/// not just documented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub direction: OrderDirection,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_id: String,
    pub is_risk: bool,
    pub ttl_ms: u64,
}

impl OrderIntent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        direction: OrderDirection,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
        time_in_force: TimeInForce,
        client_id: impl Into<String>,
        is_risk: bool,
        ttl_ms: u64,
    ) -> Self {
        if order_type == OrderType::Limit {
            debug_assert!(price.is_some(), "limit orders require a price");
        }
        Self {
            symbol: symbol.into(),
            direction,
            side,
            quantity,
            price,
            order_type,
            time_in_force,
            // Reduce-only is non-negotiable for this system: it never
            // opens a position.
            reduce_only: true,
            close_position: false,
            client_id: client_id.into(),
            is_risk,
            ttl_ms,
        }
    }

    /// A `STOP_MARKET closePosition=true` protective stop.
    pub fn protective_stop(
        symbol: impl Into<String>,
        direction: OrderDirection,
        side: Side,
        stop_price: Decimal,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            side,
            quantity: Decimal::ZERO,
            price: Some(stop_price),
            order_type: OrderType::StopMarket,
            time_in_force: TimeInForce::Gtc,
            reduce_only: true,
            close_position: true,
            client_id: client_id.into(),
            is_risk: true,
            ttl_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

/// Exchange-pushed order state transition from the user-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub side: Side,
    pub order_id: String,
    pub client_id: String,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub reduce_only: bool,
    pub close_position: bool,
    pub is_maker: bool,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub fee: Decimal,
}

/// Exchange-pushed algo (conditional) order state transition — used to
/// track stop/take-profit orders, including ones placed externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoUpdate {
    pub symbol: String,
    pub side: Side,
    pub algo_id: String,
    pub client_id: String,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub reduce_only: bool,
    pub close_position: bool,
    pub stop_price: Option<Decimal>,
}
