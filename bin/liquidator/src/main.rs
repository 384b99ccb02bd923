use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common::config::Config;
use exchange::binance::{BinanceMarketStream, BinanceRest, BinanceUserStream};
use exchange::{ExchangeRest, MarketDataFeed, ReconnectPolicy, UserDataFeed};
use orchestrator::{wait_for_signal, Orchestrator, ShutdownController};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: liquidator <config.yaml>");
            std::process::exit(2);
        }
    };

    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    info!(run_id, symbols = ?config.symbols, "liquidator starting");

    let rest: Arc<dyn ExchangeRest> = Arc::new(BinanceRest::new(
        config.exchange.api_key.clone(),
        config.exchange.api_secret.clone(),
    ));

    let policy = ReconnectPolicy::default();
    let (market_stream, market_rx) = BinanceMarketStream::new(config.symbols.clone(), policy);
    let (user_stream, user_rx) = BinanceUserStream::new(config.exchange.api_key.clone(), policy);

    tokio::spawn(async move {
        if let Err(e) = Box::new(market_stream).run().await {
            error!(error = %e, "market data feed exited");
        }
    });
    tokio::spawn(async move {
        if let Err(e) = Box::new(user_stream).run().await {
            error!(error = %e, "user data feed exited");
        }
    });

    let mut orchestrator = Orchestrator::new(config, rest, run_id);
    if let Err(e) = orchestrator.bootstrap().await {
        error!(error = %e, "bootstrap failed");
        std::process::exit(1);
    }

    let shutdown = ShutdownController::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    orchestrator.run(market_rx, user_rx, shutdown).await;
    info!("liquidator exited cleanly");
}
