use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// All configuration for one run, loaded from a single YAML file. Missing
/// or malformed config is a `fatal_config` error — the process must abort
/// initialization rather than enter the main loop, never panic mid-run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub symbols: Vec<String>,
    pub rate_limiter: RateLimiterConfig,
    pub signal: SignalConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub run: RunConfig,
}

impl Config {
    /// Load and validate configuration from a YAML file path. Never
    /// panics — the caller (the binary entry point) turns a `fatal_config`
    /// error into a non-zero exit before the main loop starts.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::FatalConfig(format!("failed to read config at '{}': {e}", path.display()))
        })?;
        let cfg: Config = serde_yaml::from_str(&content).map_err(|e| {
            Error::FatalConfig(format!("failed to parse config at '{}': {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.symbols.is_empty() {
            return Err(Error::FatalConfig("no symbols configured".into()));
        }
        if self.rate_limiter.max_orders_per_sec == 0 {
            return Err(Error::FatalConfig("rate_limiter.max_orders_per_sec must be > 0".into()));
        }
        if self.execution.maker_safety_ticks == 0 {
            return Err(Error::FatalConfig("execution.maker_safety_ticks must be >= 1".into()));
        }
        if self.run.client_id_prefix.is_empty() {
            return Err(Error::FatalConfig("run.client_id_prefix must be set".into()));
        }
        if self.risk.protective_stop.stable_prefix.is_empty() {
            return Err(Error::FatalConfig(
                "risk.protective_stop.stable_prefix must be set".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_market_ws_url")]
    pub market_ws_url: String,
    #[serde(default = "default_user_ws_url")]
    pub user_ws_url: String,
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_market_ws_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}
fn default_user_ws_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimiterConfig {
    pub max_orders_per_sec: u32,
    pub max_cancels_per_sec: u32,
}

/// A threshold/multiplier pair used by both the acceleration and ROI
/// tier tables. Tie-break rule: the highest `mult` among all tiers whose
/// threshold is satisfied always wins, never the closest threshold.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct MultiplierTier {
    pub threshold: Decimal,
    pub mult: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccelConfig {
    pub window_ms: i64,
    pub tiers: Vec<MultiplierTier>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoiConfig {
    pub tiers: Vec<MultiplierTier>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalConfig {
    pub min_signal_interval_ms: u64,
    pub stale_data_ms: i64,
    pub accel: AccelConfig,
    pub roi: RoiConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub enum PricingMode {
    AtTouch,
    InsideSpread1Tick,
    CustomTicks(u32),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    pub maker_order_ttl_ms: u64,
    pub aggr_order_ttl_ms: u64,
    pub cancel_timeout_ms: u64,
    pub repost_cooldown_ms: u64,
    pub maker_safety_ticks: u32,
    pub maker_pricing: PricingMode,
    pub base_maker_timeouts_to_escalate: u32,
    pub aggr_fills_to_deescalate: u32,
    pub aggr_timeouts_to_deescalate: u32,
    pub base_lot_mult: Decimal,
    pub max_mult: Decimal,
    pub max_order_notional: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PanicCloseTier {
    /// Tier applies when `d <= d_threshold`.
    pub d_threshold: Decimal,
    pub slice_ratio: Decimal,
    pub ttl_percent: Decimal,
    pub maker_timeouts_to_escalate: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PanicCloseConfig {
    pub tiers: Vec<PanicCloseTier>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtectiveStopConfig {
    pub enabled: bool,
    pub dist_to_liq: Decimal,
    pub debounce_startup_ms: i64,
    pub debounce_default_ms: i64,
    pub debounce_position_update_ms: i64,
    pub external_conflict_tolerance: Decimal,
    /// Stable cross-run prefix used for own protective stops — must NOT
    /// contain the volatile run-id, unlike normal order client ids.
    pub stable_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskConfig {
    pub liq_distance_threshold: Decimal,
    pub hysteresis_margin: Decimal,
    pub panic_close: PanicCloseConfig,
    pub protective_stop: ProtectiveStopConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Fixed prefix for this run's normal (non-protective-stop) order
    /// client ids: `<client_id_prefix>-<run-id>-...`.
    pub client_id_prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
exchange:
  api_key: "k"
  api_secret: "s"
symbols: ["BTCUSDT"]
rate_limiter:
  max_orders_per_sec: 5
  max_cancels_per_sec: 5
signal:
  min_signal_interval_ms: 500
  stale_data_ms: 3000
  accel:
    window_ms: 5000
    tiers:
      - { threshold: "0.002", mult: "1.5" }
  roi:
    tiers:
      - { threshold: "0.1", mult: "1.2" }
execution:
  maker_order_ttl_ms: 800
  aggr_order_ttl_ms: 500
  cancel_timeout_ms: 1000
  repost_cooldown_ms: 300
  maker_safety_ticks: 1
  maker_pricing: AtTouch
  base_maker_timeouts_to_escalate: 2
  aggr_fills_to_deescalate: 1
  aggr_timeouts_to_deescalate: 3
  base_lot_mult: "1"
  max_mult: "5"
  max_order_notional: "1000"
risk:
  liq_distance_threshold: "0.05"
  hysteresis_margin: "0.01"
  panic_close:
    tiers:
      - { d_threshold: "0.012", slice_ratio: "0.1", ttl_percent: "0.5", maker_timeouts_to_escalate: 2 }
      - { d_threshold: "0.008", slice_ratio: "0.25", ttl_percent: "0.5", maker_timeouts_to_escalate: 2 }
  protective_stop:
    enabled: true
    dist_to_liq: "0.01"
    debounce_startup_ms: 0
    debounce_default_ms: 200
    debounce_position_update_ms: 1000
    external_conflict_tolerance: "0.0001"
    stable_prefix: "liq-stop"
run:
  client_id_prefix: "liq"
"#;

    #[test]
    fn parses_a_complete_config() {
        let cfg: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT".to_string()]);
        assert_eq!(cfg.risk.panic_close.tiers.len(), 2);
    }

    #[test]
    fn rejects_empty_symbols() {
        let mut cfg: Config = serde_yaml::from_str(SAMPLE).unwrap();
        cfg.symbols.clear();
        assert!(cfg.validate().is_err());
    }
}
