//! The external interfaces the core consumes: a REST client for account
//! queries and order actions, and the two streaming feeds (market data,
//! user data). `binance` is the concrete USDT-M futures implementation;
//! `mock` is an in-memory test double used by the orchestrator's tests.

pub mod binance;
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AlgoUpdate, InstrumentRules, OrderIntent, OrderResult, OrderUpdate, Position, Result, Side};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

/// A market-data event pushed from the venue's public streams, tagged with
/// the origin timestamp. Mark-price samples do not refresh staleness —
/// only quotes and trades do; that rule lives in the signal engine, not
/// here, since this crate only carries the event across the wire.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Quote {
        symbol: String,
        best_bid: Decimal,
        best_ask: Decimal,
        at: DateTime<Utc>,
    },
    Trade {
        symbol: String,
        price: Decimal,
        at: DateTime<Utc>,
    },
    Mark {
        symbol: String,
        mark_price: Decimal,
        at: DateTime<Utc>,
    },
    /// The stream dropped and has re-established a fresh connection.
    /// Whatever happened on the venue side while disconnected is unknown —
    /// callers should treat this as a cue to reconcile state rather than
    /// trust the stream's continuity.
    Reconnected,
}

impl MarketEvent {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            MarketEvent::Quote { symbol, .. }
            | MarketEvent::Trade { symbol, .. }
            | MarketEvent::Mark { symbol, .. } => Some(symbol),
            MarketEvent::Reconnected => None,
        }
    }
}

/// A user-data event pushed from the venue's private stream.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Order(OrderUpdate),
    Algo(AlgoUpdate),
    PositionUpdate(Position),
    /// The venue reported the position's quantity reached zero; callers
    /// must drop it from any cache rather than keep a zero-qty entry.
    PositionClosed { symbol: String, side: Side },
    LeverageChanged { symbol: String, leverage: u32 },
    /// The listen key is about to expire and could not be renewed —
    /// the feed is reconnecting from scratch.
    SessionExpired,
    /// The stream dropped (for any other reason) and has re-established a
    /// fresh connection. Orders/positions may have changed while
    /// disconnected without a corresponding push — callers should
    /// reconcile state rather than trust the stream's continuity.
    Reconnected,
}

/// Account and order-action surface. Every method here is a single round
/// trip; retry/backoff policy for `transient_network` and
/// `rate_limited_by_venue` lives in the orchestrator, not the client.
#[async_trait]
pub trait ExchangeRest: Send + Sync {
    async fn fetch_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules>;

    async fn fetch_positions(&self) -> Result<HashMap<(String, Side), Position>>;

    async fn fetch_leverage_map(&self) -> Result<HashMap<String, u32>>;

    /// Must also surface `closePosition` stop orders resting in the
    /// regular order book, not just algo-tracked ones.
    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderUpdate>>;

    /// Must handle both a bare array response and a wrapped
    /// `{ "orders": [...] }` object — the venue uses both forms depending
    /// on the endpoint.
    async fn fetch_open_algo_orders(&self, symbol: Option<&str>) -> Result<Vec<AlgoUpdate>>;

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult>;

    async fn cancel(
        &self,
        order_id: Option<&str>,
        client_id: Option<&str>,
        is_algo: bool,
    ) -> Result<OrderResult>;

    /// Tries the normal order book first, then the algo book, so callers
    /// don't need to track which book an order lives in.
    async fn cancel_any(&self, order_id: Option<&str>, client_id: Option<&str>) -> Result<OrderResult>;
}

/// A running market-data feed. `subscribe` can be called any number of
/// times before `run` is driven; `run` owns the connection loop,
/// including reconnect with exponential backoff, and never returns
/// except on an unrecoverable setup error.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<MarketEvent>;

    async fn run(self: Box<Self>) -> Result<()>;
}

/// A running user-data feed. Implementations must renew their session
/// token on a timer (~every 30 min) and auto-reconnect with exponential
/// backoff starting at `initial_delay_ms`, capped at `max_delay_ms`.
#[async_trait]
pub trait UserDataFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<UserEvent>;

    async fn run(self: Box<Self>) -> Result<()>;
}

/// Backoff policy shared by both streaming feeds.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self { initial_delay_ms, max_delay_ms }
    }

    pub fn next_delay_ms(&self, current_ms: u64) -> u64 {
        current_ms.saturating_mul(2).min(self.max_delay_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { initial_delay_ms: 1_000, max_delay_ms: 60_000 }
    }
}
