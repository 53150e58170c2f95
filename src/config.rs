//! Collector configuration
//!
//! Loaded from TOML, falling back to defaults for anything missing.

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Binance symbol, lower case (e.g. `btcusdt`)
    pub symbol: String,

    /// Binance raw stream base, `<base>/<symbol>@depth@100ms`
    pub binance_ws_base: String,

    /// Book levels per side fed to the book aggregator
    pub levels_used: usize,

    /// Enable the Polymarket quote listener
    pub polymarket_enabled: bool,

    /// Polymarket CLOB market channel
    pub polymarket_ws_url: String,

    /// Gamma API market-by-slug endpoint
    pub gamma_markets_url: String,

    /// Slug prefix; the candle start second is appended
    pub market_slug_prefix: String,

    /// Output root directory
    pub data_dir: PathBuf,

    /// File name of the merged stream
    pub combined_file: String,

    /// Also write per-source streams next to the merged one
    pub write_source_streams: bool,

    /// Output (and Polymarket market) rotation width, minutes
    pub rotation_minutes: u32,

    /// Queue depth above which the sink reports backpressure
    pub sink_high_water: usize,

    /// Listener -> aggregator channel capacity
    pub event_channel_capacity: usize,

    /// Aggregators/quotes -> coordinator channel capacity
    pub coordinator_channel_capacity: usize,

    /// Stats log interval, seconds
    pub stats_interval_secs: u64,

    /// Session log directory; no file log when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            symbol: "btcusdt".to_string(),
            binance_ws_base: "wss://stream.binance.com:9443/ws".to_string(),
            levels_used: 10,
            polymarket_enabled: true,
            polymarket_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            gamma_markets_url: "https://gamma-api.polymarket.com/markets/slug".to_string(),
            market_slug_prefix: "btc-updown-15m".to_string(),
            data_dir: PathBuf::from("data"),
            combined_file: "combined_data.jsonl".to_string(),
            write_source_streams: false,
            rotation_minutes: 15,
            sink_high_water: 10_000,
            event_channel_capacity: 4096,
            coordinator_channel_capacity: 4096,
            stats_interval_secs: 60,
            log_dir: None,
        }
    }
}

impl CollectorConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load from `COLLECTOR_CONFIG_PATH` (default `collector.toml`), or defaults
    pub fn from_env() -> Self {
        let path = std::env::var("COLLECTOR_CONFIG_PATH")
            .unwrap_or_else(|_| "collector.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default collector config ({}): {:#}", path, e);
            Self::default()
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.symbol.trim().is_empty(), "symbol must not be empty");
        ensure!(self.levels_used > 0, "levels_used must be positive");
        ensure!(
            self.rotation_minutes > 0 && 60 % self.rotation_minutes == 0,
            "rotation_minutes must divide 60, got {}",
            self.rotation_minutes
        );
        ensure!(
            self.event_channel_capacity > 0 && self.coordinator_channel_capacity > 0,
            "channel capacities must be positive"
        );
        ensure!(self.stats_interval_secs > 0, "stats_interval_secs must be positive");
        Ok(())
    }

    pub fn depth_stream_url(&self) -> String {
        format!(
            "{}/{}@depth@100ms",
            self.binance_ws_base.trim_end_matches('/'),
            self.symbol.to_lowercase()
        )
    }

    pub fn trade_stream_url(&self) -> String {
        format!(
            "{}/{}@trade",
            self.binance_ws_base.trim_end_matches('/'),
            self.symbol.to_lowercase()
        )
    }
}
