use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};
use url::Url;

use crate::{MarketDataFeed, MarketEvent, ReconnectPolicy};
use common::{Error, Result};

/// Combined book-ticker + mark-price + aggregate-trade stream for a set of
/// symbols, multiplexed over Binance's combined-stream endpoint.
/// Reconnects forever with exponential backoff; a clean close is treated
/// the same as an error since the venue is expected to stay connected.
pub struct BinanceMarketStream {
    symbols: Vec<String>,
    tx: broadcast::Sender<MarketEvent>,
    policy: ReconnectPolicy,
}

impl BinanceMarketStream {
    pub fn new(symbols: Vec<String>, policy: ReconnectPolicy) -> (Self, broadcast::Receiver<MarketEvent>) {
        let (tx, rx) = broadcast::channel(4096);
        (Self { symbols, tx, policy }, rx)
    }

    fn stream_url(&self) -> Result<Url> {
        let streams = self
            .symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                vec![
                    format!("{lower}@bookTicker"),
                    format!("{lower}@aggTrade"),
                    format!("{lower}@markPrice@1s"),
                ]
            })
            .collect::<Vec<_>>()
            .join("/");
        let url = format!("wss://fstream.binance.com/stream?streams={streams}");
        Url::parse(&url).map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn connect_once(&self) -> Result<()> {
        let url = self.stream_url()?;
        let (ws_stream, _) = connect_async(url).await.map_err(|e| Error::WebSocket(e.to_string()))?;
        let (_, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                match parse_event(&text) {
                    Ok(Some(event)) => {
                        let _ = self.tx.send(event);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse market stream frame"),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataFeed for BinanceMarketStream {
    fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.tx.subscribe()
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let mut backoff_ms = self.policy.initial_delay_ms;
        let mut first_connect = true;
        loop {
            if !first_connect {
                let _ = self.tx.send(MarketEvent::Reconnected);
            }
            first_connect = false;

            info!(symbols = ?self.symbols, "connecting to market data stream");
            match self.connect_once().await {
                Ok(()) => {
                    info!("market data stream closed cleanly, reconnecting");
                    backoff_ms = self.policy.initial_delay_ms;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms, "market data stream error, reconnecting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = self.policy.next_delay_ms(backoff_ms);
                    continue;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.policy.initial_delay_ms)).await;
        }
    }
}

#[derive(Deserialize)]
struct CombinedFrame {
    stream: String,
    data: serde_json::Value,
}

fn parse_event(text: &str) -> Result<Option<MarketEvent>> {
    let frame: CombinedFrame = serde_json::from_str(text).map_err(|e| Error::Other(e.to_string()))?;
    let now = Utc::now();

    if frame.stream.ends_with("@bookTicker") {
        let bt: BookTicker = serde_json::from_value(frame.data).map_err(|e| Error::Other(e.to_string()))?;
        let best_bid: Decimal = bt.best_bid.parse().map_err(|_| Error::PrecisionViolation(bt.best_bid))?;
        let best_ask: Decimal = bt.best_ask.parse().map_err(|_| Error::PrecisionViolation(bt.best_ask))?;
        return Ok(Some(MarketEvent::Quote { symbol: bt.symbol, best_bid, best_ask, at: now }));
    }
    if frame.stream.ends_with("@aggTrade") {
        let t: AggTrade = serde_json::from_value(frame.data).map_err(|e| Error::Other(e.to_string()))?;
        let price: Decimal = t.price.parse().map_err(|_| Error::PrecisionViolation(t.price))?;
        return Ok(Some(MarketEvent::Trade { symbol: t.symbol, price, at: now }));
    }
    if frame.stream.contains("@markPrice") {
        let m: MarkPrice = serde_json::from_value(frame.data).map_err(|e| Error::Other(e.to_string()))?;
        let mark_price: Decimal = m.mark_price.parse().map_err(|_| Error::PrecisionViolation(m.mark_price))?;
        return Ok(Some(MarketEvent::Mark { symbol: m.symbol, mark_price, at: now }));
    }
    Ok(None)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    best_bid: String,
    #[serde(rename = "a")]
    best_ask: String,
}

#[derive(Deserialize)]
struct AggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
}

#[derive(Deserialize)]
struct MarkPrice {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
}
