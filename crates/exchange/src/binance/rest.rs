use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::ExchangeRest;
use common::{
    AlgoUpdate, Error, ErrorKind, InstrumentRules, OrderDirection, OrderIntent, OrderResult,
    OrderStatus, OrderType, OrderUpdate, Position, Result, Side, TimeInForce,
};

const BASE_URL: &str = "https://fapi.binance.com";
const ALGO_BASE_URL: &str = "https://papi.binance.com";

/// REST client for Binance USDT-M futures (the `fapi` surface) plus the
/// portfolio-margin algo endpoints for server-resident conditional orders.
pub struct BinanceRest {
    api_key: String,
    secret: String,
    http: Client,
}

impl BinanceRest {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64
    }

    fn sign(&self, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> Error {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Error::RateLimitedByVenue(body.to_string());
        }
        if body.contains("\"code\":-2010") || body.contains("would immediately match") {
            return Error::PostOnlyReject(body.to_string());
        }
        if body.contains("\"code\":-2022") {
            return Error::ReduceOnlyViolation(body.to_string());
        }
        if body.contains("\"code\":-2019") || body.contains("\"code\":-1013") {
            return Error::PrecisionViolation(body.to_string());
        }
        if body.contains("\"code\":-2011") && body.contains("Unknown order") {
            return Error::OrderNotFound(body.to_string());
        }
        if body.contains("\"code\":-2021") {
            return Error::DuplicateClientId(body.to_string());
        }
        if status.is_server_error() {
            return Error::TransientNetwork(format!("HTTP {status}: {body}"));
        }
        Error::Other(format!("HTTP {status}: {body}"))
    }

    async fn signed_get(&self, base: &str, path: &str, params: &str) -> Result<String> {
        let ts = Self::timestamp_ms();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = self.sign(&query);
        let url = format!("{base}{path}?{query}&signature={signature}");

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &body));
        }
        Ok(body)
    }

    async fn signed_post(&self, base: &str, path: &str, params: &str) -> Result<String> {
        let ts = Self::timestamp_ms();
        let query = format!("{params}&timestamp={ts}");
        let signature = self.sign(&query);
        let body = format!("{query}&signature={signature}");
        let url = format!("{base}{path}");

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &text));
        }
        Ok(text)
    }

    async fn signed_delete(&self, base: &str, path: &str, params: &str) -> Result<String> {
        let ts = Self::timestamp_ms();
        let query = format!("{params}&timestamp={ts}");
        let signature = self.sign(&query);
        let url = format!("{base}{path}?{query}&signature={signature}");

        let resp = self
            .http
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &text));
        }
        Ok(text)
    }
}

#[async_trait]
impl ExchangeRest for BinanceRest {
    async fn fetch_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules> {
        let url = format!("{BASE_URL}/fapi/v1/exchangeInfo?symbol={symbol}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &body));
        }

        let info: ExchangeInfo =
            serde_json::from_str(&body).map_err(|e| Error::Other(e.to_string()))?;
        let sym = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| Error::Other(format!("unknown symbol {symbol}")))?;

        let mut tick_size = Decimal::ZERO;
        let mut step_size = Decimal::ZERO;
        let mut min_qty = Decimal::ZERO;
        let mut min_notional = Decimal::ZERO;
        for filter in &sym.filters {
            match filter.filter_type.as_str() {
                "PRICE_FILTER" => tick_size = parse_decimal(&filter.tick_size)?,
                "LOT_SIZE" => {
                    step_size = parse_decimal(&filter.step_size)?;
                    min_qty = parse_decimal(&filter.min_qty)?;
                }
                "MIN_NOTIONAL" => min_notional = parse_decimal(&filter.notional)?,
                _ => {}
            }
        }

        Ok(InstrumentRules::new(
            symbol,
            tick_size,
            step_size,
            min_qty,
            min_notional,
            sym.leverage_hint.unwrap_or(1),
        ))
    }

    async fn fetch_positions(&self) -> Result<HashMap<(String, Side), Position>> {
        let body = self.signed_get(BASE_URL, "/fapi/v2/positionRisk", "").await?;
        let rows: Vec<PositionRiskRow> =
            serde_json::from_str(&body).map_err(|e| Error::Other(e.to_string()))?;

        let mut out = HashMap::new();
        for row in rows {
            let amt = parse_decimal(&row.position_amt)?;
            if amt.is_zero() {
                continue;
            }
            let side = match row.position_side.as_str() {
                "LONG" => Side::Long,
                "SHORT" => Side::Short,
                _ if amt.is_sign_positive() => Side::Long,
                _ => Side::Short,
            };
            let position = Position {
                symbol: row.symbol.clone(),
                side,
                position_amt: amt.abs(),
                entry_price: parse_decimal(&row.entry_price)?,
                mark_price: parse_decimal(&row.mark_price)?,
                liquidation_price: parse_decimal(&row.liquidation_price)?,
                unrealized_pnl: parse_decimal(&row.un_realized_profit)?,
            };
            out.insert((row.symbol, side), position);
        }
        Ok(out)
    }

    async fn fetch_leverage_map(&self) -> Result<HashMap<String, u32>> {
        let body = self.signed_get(BASE_URL, "/fapi/v2/positionRisk", "").await?;
        let rows: Vec<PositionRiskRow> =
            serde_json::from_str(&body).map_err(|e| Error::Other(e.to_string()))?;
        let mut out = HashMap::new();
        for row in rows {
            if let Some(leverage) = row.leverage {
                out.insert(row.symbol, leverage);
            }
        }
        Ok(out)
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderUpdate>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self.signed_get(BASE_URL, "/fapi/v1/openOrders", &params).await?;
        let rows: Vec<OpenOrderRow> =
            serde_json::from_str(&body).map_err(|e| Error::Other(e.to_string()))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn fetch_open_algo_orders(&self, symbol: Option<&str>) -> Result<Vec<AlgoUpdate>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .signed_get(ALGO_BASE_URL, "/papi/v1/algo/futures/openOrders", &params)
            .await?;

        // The venue returns a bare array on some deployments and a
        // `{"orders": [...]}` wrapper on others — accept either.
        let rows: Vec<AlgoOrderRow> = match serde_json::from_str::<Vec<AlgoOrderRow>>(&body) {
            Ok(rows) => rows,
            Err(_) => {
                let wrapped: AlgoOrdersWrapper =
                    serde_json::from_str(&body).map_err(|e| Error::Other(e.to_string()))?;
                wrapped.orders
            }
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let side = match intent.direction {
            OrderDirection::Buy => "BUY",
            OrderDirection::Sell => "SELL",
        };
        let position_side = match intent.side {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        };

        let mut params = format!(
            "symbol={}&side={}&positionSide={}&reduceOnly={}&newClientOrderId={}",
            intent.symbol, side, position_side, intent.reduce_only, intent.client_id
        );

        match intent.order_type {
            OrderType::Limit => {
                let price = intent
                    .price
                    .ok_or_else(|| Error::Other("limit order missing price".into()))?;
                let tif = match intent.time_in_force {
                    TimeInForce::Gtc => "GTC",
                    TimeInForce::Gtx => "GTX",
                };
                params.push_str(&format!(
                    "&type=LIMIT&quantity={}&price={}&timeInForce={}",
                    intent.quantity, price, tif
                ));
            }
            OrderType::StopMarket => {
                let stop_price = intent
                    .price
                    .ok_or_else(|| Error::Other("stop order missing trigger price".into()))?;
                params.push_str(&format!(
                    "&type=STOP_MARKET&stopPrice={}&workingType=MARK_PRICE&closePosition={}",
                    stop_price, intent.close_position
                ));
            }
        }

        debug!(symbol = %intent.symbol, side = %side, client_id = %intent.client_id, "submitting order");
        let body = self.signed_post(BASE_URL, "/fapi/v1/order", &params).await?;
        let resp: OrderResponse =
            serde_json::from_str(&body).map_err(|e| Error::Other(e.to_string()))?;

        Ok(OrderResult {
            success: true,
            order_id: Some(resp.order_id.to_string()),
            status: Some(parse_status(&resp.status)),
            filled_qty: parse_decimal(&resp.executed_qty).unwrap_or(Decimal::ZERO),
            avg_price: resp.avg_price.as_deref().and_then(|p| parse_decimal(p).ok()),
            error_code: None,
        })
    }

    async fn cancel(
        &self,
        order_id: Option<&str>,
        client_id: Option<&str>,
        is_algo: bool,
    ) -> Result<OrderResult> {
        let mut params = String::new();
        if let Some(id) = order_id {
            params.push_str(&format!("orderId={id}"));
        } else if let Some(cid) = client_id {
            params.push_str(&format!("origClientOrderId={cid}"));
        } else {
            return Err(Error::Other("cancel requires an order_id or client_id".into()));
        }

        let (base, path) = if is_algo {
            (ALGO_BASE_URL, "/papi/v1/algo/futures/order")
        } else {
            (BASE_URL, "/fapi/v1/order")
        };
        let body = self.signed_delete(base, path, &params).await;
        match body {
            Ok(_) => Ok(OrderResult {
                success: true,
                order_id: order_id.map(str::to_string),
                status: Some(OrderStatus::Canceled),
                filled_qty: Decimal::ZERO,
                avg_price: None,
                error_code: None,
            }),
            Err(e) if e.kind() == ErrorKind::OrderNotFound => Ok(OrderResult {
                success: false,
                order_id: order_id.map(str::to_string),
                status: None,
                filled_qty: Decimal::ZERO,
                avg_price: None,
                error_code: Some("order_not_found".into()),
            }),
            Err(e) => Err(e),
        }
    }

    async fn cancel_any(&self, order_id: Option<&str>, client_id: Option<&str>) -> Result<OrderResult> {
        let result = ExchangeRest::cancel(self, order_id, client_id, false).await?;
        if result.success {
            return Ok(result);
        }
        ExchangeRest::cancel(self, order_id, client_id, true).await
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    s.parse::<Decimal>()
        .map_err(|e| Error::PrecisionViolation(format!("{s}: {e}")))
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

fn parse_order_type(s: &str) -> OrderType {
    if s == "STOP_MARKET" {
        OrderType::StopMarket
    } else {
        OrderType::Limit
    }
}

// ─── Response shapes ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<Filter>,
    #[serde(default)]
    leverage_hint: Option<u32>,
}

#[derive(Deserialize)]
struct Filter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(default, rename = "tickSize")]
    tick_size: String,
    #[serde(default, rename = "stepSize")]
    step_size: String,
    #[serde(default, rename = "minQty")]
    min_qty: String,
    #[serde(default)]
    notional: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskRow {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    liquidation_price: String,
    un_realized_profit: String,
    #[serde(default)]
    position_side: String,
    #[serde(default)]
    leverage: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderRow {
    symbol: String,
    order_id: i64,
    client_order_id: String,
    status: String,
    #[serde(rename = "type")]
    order_type: String,
    reduce_only: bool,
    #[serde(default)]
    close_position: bool,
    #[serde(default)]
    position_side: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    avg_price: Option<String>,
}

impl TryFrom<OpenOrderRow> for OrderUpdate {
    type Error = Error;

    fn try_from(row: OpenOrderRow) -> Result<Self> {
        let side = match row.position_side.as_str() {
            "SHORT" => Side::Short,
            _ => Side::Long,
        };
        Ok(OrderUpdate {
            symbol: row.symbol,
            side,
            order_id: row.order_id.to_string(),
            client_id: row.client_order_id,
            status: parse_status(&row.status),
            order_type: parse_order_type(&row.order_type),
            reduce_only: row.reduce_only,
            close_position: row.close_position,
            is_maker: false,
            filled_qty: parse_decimal(&row.executed_qty).unwrap_or(Decimal::ZERO),
            avg_price: row.avg_price.as_deref().and_then(|p| parse_decimal(p).ok()),
            realized_pnl: Decimal::ZERO,
            fee: Decimal::ZERO,
        })
    }
}

#[derive(Deserialize)]
struct AlgoOrdersWrapper {
    orders: Vec<AlgoOrderRow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlgoOrderRow {
    symbol: String,
    algo_id: i64,
    #[serde(default)]
    client_algo_id: String,
    algo_status: String,
    #[serde(default)]
    position_side: String,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    close_position: bool,
    #[serde(default)]
    stop_price: Option<String>,
}

impl TryFrom<AlgoOrderRow> for AlgoUpdate {
    type Error = Error;

    fn try_from(row: AlgoOrderRow) -> Result<Self> {
        let side = match row.position_side.as_str() {
            "SHORT" => Side::Short,
            _ => Side::Long,
        };
        Ok(AlgoUpdate {
            symbol: row.symbol,
            side,
            algo_id: row.algo_id.to_string(),
            client_id: row.client_algo_id,
            status: parse_status(&row.algo_status),
            order_type: OrderType::StopMarket,
            reduce_only: row.reduce_only,
            close_position: row.close_position,
            stop_price: row.stop_price.as_deref().and_then(|p| parse_decimal(p).ok()),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    avg_price: Option<String>,
}
