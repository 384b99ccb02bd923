//! Binance USDT-M futures implementation of the exchange interfaces.

mod market_stream;
mod rest;
mod user_stream;

pub use market_stream::BinanceMarketStream;
pub use rest::BinanceRest;
pub use user_stream::BinanceUserStream;
