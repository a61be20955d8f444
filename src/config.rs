use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{EngineConfig, GridConfig, PaperConfig, RetryPolicy};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Order placement and caching
    #[serde(default)]
    pub engine: EngineSettings,
    /// Where sessions are persisted
    #[serde(default)]
    pub storage: StorageConfig,
    /// Simulated exchange account
    #[serde(default)]
    pub paper: PaperConfig,
    /// Price replay for the paper exchange
    #[serde(default)]
    pub feed: FeedConfig,
    /// Sessions started at boot
    #[serde(default)]
    pub sessions: Vec<SessionSettings>,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Enable the HTTP API
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    /// Server port (default 3000)
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Server host (default 127.0.0.1)
    #[serde(default = "default_server_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            host: default_server_host(),
        }
    }
}

fn default_server_enabled() -> bool {
    false
}

fn default_server_port() -> u16 {
    3000
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Placement attempts per order, including the first
    pub max_order_retries: u32,
    pub buy_retry_delay_secs: u64,
    pub sell_retry_delay_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_order_retries: 10,
            buy_retry_delay_secs: 60,
            sell_retry_delay_secs: 5,
            cache_ttl_secs: 1800,
        }
    }
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::new(
                self.max_order_retries,
                Duration::from_secs(self.buy_retry_delay_secs),
                Duration::from_secs(self.sell_retry_delay_secs),
            ),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct StorageConfig {
    /// Directory for `<session id>.json` files; sessions live in memory when unset
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct FeedConfig {
    /// File of `symbol,price` lines pushed to the paper exchange in order
    pub replay_file: Option<PathBuf>,
    /// Pause between replayed prices
    #[serde(default = "default_feed_interval")]
    pub interval_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            replay_file: None,
            interval_ms: default_feed_interval(),
        }
    }
}

fn default_feed_interval() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Exchange symbol, e.g. "BTCUSDT"
    pub symbol: String,
    pub grid: GridConfig,
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment variables override the file,
            // e.g. APP__ENGINE__MAX_ORDER_RETRIES=3
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Load settings from TOML text, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.log.level, "info");
        assert!(!settings.server.enabled);
        assert_eq!(settings.server.port, 3000);
        assert!(settings.storage.state_dir.is_none());
        assert!(settings.sessions.is_empty());

        let engine = settings.engine.to_engine_config();
        assert_eq!(engine.retry.max_attempts, 10);
        assert_eq!(engine.retry.buy_delay, Duration::from_secs(60));
        assert_eq!(engine.retry.sell_delay, Duration::from_secs(5));
        assert_eq!(engine.cache_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[engine]\nmax_order_retries = 7\nsell_retry_delay_secs = 9\n").unwrap();

        std::env::set_var("APP__ENGINE__MAX_ORDER_RETRIES", "4");
        let settings = Settings::new(path.to_str().unwrap());
        std::env::remove_var("APP__ENGINE__MAX_ORDER_RETRIES");
        let settings = settings.unwrap();

        assert_eq!(settings.engine.max_order_retries, 4);
        assert_eq!(settings.engine.sell_retry_delay_secs, 9);
    }

    #[test]
    fn test_full_file() {
        let settings = Settings::from_toml_str(
            r#"
            [log]
            level = "debug"

            [engine]
            max_order_retries = 3
            buy_retry_delay_secs = 2

            [storage]
            state_dir = "state"

            [paper]
            quote_balance = 5000.0
            tick_size = "0.01000000"
            step_size = "0.00100000"

            [[paper.markets]]
            symbol = "BTCUSDT"
            base_balance = 0.5
            price = 100.0

            [feed]
            replay_file = "prices.csv"
            interval_ms = 50

            [[sessions]]
            symbol = "BTCUSDT"

            [sessions.grid]
            total_grid_levels = 5
            base_trade_value = 100.0
            initial_gap_percent = 0.01
            gap_reduction_percent = 0.9
            max_gap_percent = 0.01
            min_gap_percent = 0.001
            reset_grid_percent = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.engine.max_order_retries, 3);
        assert_eq!(settings.engine.buy_retry_delay_secs, 2);
        assert_eq!(settings.engine.sell_retry_delay_secs, 5);
        assert_eq!(settings.storage.state_dir, Some(PathBuf::from("state")));
        assert_eq!(settings.paper.quote_balance, 5000.0);
        assert_eq!(settings.paper.markets.len(), 1);
        assert_eq!(settings.paper.markets[0].symbol, "BTCUSDT");
        assert_eq!(settings.feed.interval_ms, 50);

        assert_eq!(settings.sessions.len(), 1);
        let session = &settings.sessions[0];
        assert_eq!(session.symbol, "BTCUSDT");
        assert_eq!(session.grid.total_grid_levels, 5);
        assert_eq!(session.grid.reset_increment_percent, 0.0);
        assert!(session.grid.validate().is_ok());
    }
}
