use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};
use url::Url;

use crate::{ReconnectPolicy, UserDataFeed, UserEvent};
use common::{AlgoUpdate, Error, OrderStatus, OrderType, OrderUpdate, Result, Side};

const BASE_URL: &str = "https://fapi.binance.com";
const LISTEN_KEY_RENEW_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Private order/position/leverage stream, keyed by a listen key that must
/// be renewed every ~30 minutes or the venue drops the connection.
pub struct BinanceUserStream {
    api_key: String,
    http: Client,
    tx: broadcast::Sender<UserEvent>,
    policy: ReconnectPolicy,
}

impl BinanceUserStream {
    pub fn new(api_key: impl Into<String>, policy: ReconnectPolicy) -> (Self, broadcast::Receiver<UserEvent>) {
        let (tx, rx) = broadcast::channel(4096);
        (
            Self {
                api_key: api_key.into(),
                http: Client::builder().use_rustls_tls().build().expect("failed to build HTTP client"),
                tx,
                policy,
            },
            rx,
        )
    }

    async fn create_listen_key(&self) -> Result<String> {
        let resp = self
            .http
            .post(format!("{BASE_URL}/fapi/v1/listenKey"))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        let body = resp.text().await.map_err(|e| Error::TransientNetwork(e.to_string()))?;
        let parsed: ListenKeyResponse = serde_json::from_str(&body).map_err(|e| Error::FatalAuth(e.to_string()))?;
        Ok(parsed.listen_key)
    }

    async fn renew_listen_key(&self) -> Result<()> {
        self.http
            .put(format!("{BASE_URL}/fapi/v1/listenKey"))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        Ok(())
    }

    /// Returns `Ok(true)` if the connection ended because the listen key
    /// could not be renewed (a `SessionExpired` event was already sent),
    /// `Ok(false)` for any other clean end of the socket.
    async fn connect_once(&self, listen_key: &str) -> Result<bool> {
        let url = Url::parse(&format!("wss://fstream.binance.com/ws/{listen_key}"))
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (ws_stream, _) = connect_async(url).await.map_err(|e| Error::WebSocket(e.to_string()))?;
        let (_, mut read) = ws_stream.split();

        let mut renew_at = tokio::time::Instant::now() + LISTEN_KEY_RENEW_INTERVAL;
        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(false) };
                    let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_event(&text) {
                            Ok(events) => for event in events { let _ = self.tx.send(event); },
                            Err(e) => warn!(error = %e, "failed to parse user stream frame"),
                        }
                    }
                }
                _ = tokio::time::sleep_until(renew_at) => {
                    if self.renew_listen_key().await.is_err() {
                        warn!("listen key renewal failed, forcing reconnect");
                        let _ = self.tx.send(UserEvent::SessionExpired);
                        return Ok(true);
                    }
                    renew_at = tokio::time::Instant::now() + LISTEN_KEY_RENEW_INTERVAL;
                }
            }
        }
    }
}

#[async_trait]
impl UserDataFeed for BinanceUserStream {
    fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let mut backoff_ms = self.policy.initial_delay_ms;
        let mut first_connect = true;
        let mut session_expired = false;
        loop {
            let listen_key = match self.create_listen_key().await {
                Ok(key) => key,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, backoff_ms, "failed to create listen key, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = self.policy.next_delay_ms(backoff_ms);
                    continue;
                }
            };

            if !first_connect && !session_expired {
                let _ = self.tx.send(UserEvent::Reconnected);
            }
            first_connect = false;

            info!("connecting to user data stream");
            match self.connect_once(&listen_key).await {
                Ok(expired) => {
                    info!("user data stream closed, reconnecting");
                    backoff_ms = self.policy.initial_delay_ms;
                    session_expired = expired;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms, "user data stream error, reconnecting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = self.policy.next_delay_ms(backoff_ms);
                    session_expired = false;
                }
            }
        }
    }
}

fn parse_event(text: &str) -> Result<Vec<UserEvent>> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| Error::Other(e.to_string()))?;
    let event_type = value.get("e").and_then(|v| v.as_str()).unwrap_or_default();

    match event_type {
        "ORDER_TRADE_UPDATE" => {
            let wrapper: OrderTradeUpdateFrame =
                serde_json::from_value(value).map_err(|e| Error::Other(e.to_string()))?;
            Ok(vec![UserEvent::Order(wrapper.order.try_into()?)])
        }
        "ACCOUNT_UPDATE" => {
            let wrapper: AccountUpdateFrame =
                serde_json::from_value(value).map_err(|e| Error::Other(e.to_string()))?;
            let mut events = Vec::new();
            for p in wrapper.update.positions {
                let amt: Decimal = p.position_amt.parse().unwrap_or(Decimal::ZERO);
                let side = if p.position_side == "SHORT" { Side::Short } else { Side::Long };
                if amt.is_zero() {
                    events.push(UserEvent::PositionClosed { symbol: p.symbol, side });
                } else {
                    events.push(UserEvent::PositionUpdate(common::Position {
                        symbol: p.symbol,
                        side,
                        position_amt: amt.abs(),
                        entry_price: p.entry_price.parse().unwrap_or(Decimal::ZERO),
                        mark_price: Decimal::ZERO,
                        liquidation_price: Decimal::ZERO,
                        unrealized_pnl: p.unrealized_pnl.parse().unwrap_or(Decimal::ZERO),
                    }));
                }
            }
            Ok(events)
        }
        "ACCOUNT_CONFIG_UPDATE" => {
            let wrapper: AccountConfigFrame =
                serde_json::from_value(value).map_err(|e| Error::Other(e.to_string()))?;
            match wrapper.leverage_update {
                Some(lu) => Ok(vec![UserEvent::LeverageChanged { symbol: lu.symbol, leverage: lu.leverage }]),
                None => Ok(vec![]),
            }
        }
        "STRATEGY_UPDATE" => {
            let wrapper: StrategyUpdateFrame =
                serde_json::from_value(value).map_err(|e| Error::Other(e.to_string()))?;
            Ok(vec![UserEvent::Algo(wrapper.strategy.into())])
        }
        _ => Ok(vec![]),
    }
}

#[derive(Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

#[derive(Deserialize)]
struct OrderTradeUpdateFrame {
    #[serde(rename = "o")]
    order: OrderTradeUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderTradeUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "c")]
    client_order_id: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "R")]
    reduce_only: bool,
    #[serde(default, rename = "cp")]
    close_position: bool,
    #[serde(rename = "ps")]
    position_side: String,
    #[serde(rename = "m")]
    is_maker: bool,
    #[serde(rename = "l")]
    last_filled_qty: String,
    #[serde(rename = "L")]
    last_filled_price: String,
    #[serde(rename = "rp")]
    realized_pnl: String,
    #[serde(default, rename = "n")]
    fee: String,
}

impl TryFrom<OrderTradeUpdate> for OrderUpdate {
    type Error = Error;

    fn try_from(o: OrderTradeUpdate) -> Result<Self> {
        Ok(OrderUpdate {
            symbol: o.symbol,
            side: if o.position_side == "SHORT" { Side::Short } else { Side::Long },
            order_id: o.order_id.to_string(),
            client_id: o.client_order_id,
            status: parse_status(&o.status),
            order_type: if o.order_type == "STOP_MARKET" { OrderType::StopMarket } else { OrderType::Limit },
            reduce_only: o.reduce_only,
            close_position: o.close_position,
            is_maker: o.is_maker,
            filled_qty: o.last_filled_qty.parse().unwrap_or(Decimal::ZERO),
            avg_price: o.last_filled_price.parse().ok(),
            realized_pnl: o.realized_pnl.parse().unwrap_or(Decimal::ZERO),
            fee: o.fee.parse().unwrap_or(Decimal::ZERO),
        })
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::Rejected,
    }
}

#[derive(Deserialize)]
struct AccountUpdateFrame {
    #[serde(rename = "a")]
    update: AccountUpdateData,
}

#[derive(Deserialize)]
struct AccountUpdateData {
    #[serde(rename = "P")]
    positions: Vec<AccountPosition>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountPosition {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    position_amt: String,
    #[serde(rename = "ep")]
    entry_price: String,
    #[serde(rename = "ps")]
    position_side: String,
    #[serde(rename = "up")]
    unrealized_pnl: String,
}

#[derive(Deserialize)]
struct AccountConfigFrame {
    #[serde(rename = "ac")]
    leverage_update: Option<LeverageUpdate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeverageUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "l")]
    leverage: u32,
}

#[derive(Deserialize)]
struct StrategyUpdateFrame {
    #[serde(rename = "su")]
    strategy: StrategyUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrategyUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "si")]
    strategy_id: i64,
    #[serde(rename = "c")]
    client_strategy_id: String,
    #[serde(rename = "ss")]
    strategy_status: String,
    #[serde(rename = "ps")]
    position_side: String,
    #[serde(default, rename = "rp")]
    reduce_only: bool,
    #[serde(default, rename = "cp")]
    close_position: bool,
    #[serde(default, rename = "sp")]
    stop_price: Option<String>,
}

impl From<StrategyUpdate> for AlgoUpdate {
    fn from(s: StrategyUpdate) -> Self {
        AlgoUpdate {
            symbol: s.symbol,
            side: if s.position_side == "SHORT" { Side::Short } else { Side::Long },
            algo_id: s.strategy_id.to_string(),
            client_id: s.client_strategy_id,
            status: parse_status(&s.strategy_status),
            order_type: OrderType::StopMarket,
            reduce_only: s.reduce_only,
            close_position: s.close_position,
            stop_price: s.stop_price.and_then(|p| p.parse().ok()),
        }
    }
}
