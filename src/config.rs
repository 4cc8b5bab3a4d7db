use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::engine::EngineOptions;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::executor::RetryPolicy;
use crate::grid::kraken::KRAKEN_REST_URL;
use crate::grid::runner::RunnerConfig;
use crate::grid::sizer::OrderSizer;
use crate::grid::TradingPairConfig;

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Exchange connection (endpoint, retries, timeouts)
    #[serde(default)]
    pub exchange: ExchangeSettings,
    /// Reconciliation loop and persistence paths
    #[serde(default)]
    pub engine: EngineSettings,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Traded pairs
    #[serde(default)]
    pub pairs: Vec<TradingPairConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeSettings {
    /// REST endpoint base URL
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Attempts per private call before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay, doubled on every retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ExchangeSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_rest_url() -> String {
    KRAKEN_REST_URL.to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Pause between placements while building a grid
    #[serde(default = "default_order_delay_ms")]
    pub order_delay_ms: u64,
    /// Pause between replacement placements after fills
    #[serde(default = "default_replacement_delay_ms")]
    pub replacement_delay_ms: u64,
    #[serde(default = "default_pnl_report_interval_secs")]
    pub pnl_report_interval_secs: u64,
    /// Fraction of available balance committed to orders
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Cancel all open orders and rebuild every grid on startup
    #[serde(default)]
    pub cancel_all_on_startup: bool,
    /// Directory holding state, ledger and nonce files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,
    /// Keep the last nonce on disk so restarts never reuse one
    #[serde(default = "default_persist_nonce")]
    pub persist_nonce: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            order_delay_ms: default_order_delay_ms(),
            replacement_delay_ms: default_replacement_delay_ms(),
            pnl_report_interval_secs: default_pnl_report_interval_secs(),
            safety_margin: default_safety_margin(),
            cancel_all_on_startup: false,
            data_dir: default_data_dir(),
            state_file: default_state_file(),
            ledger_file: default_ledger_file(),
            persist_nonce: default_persist_nonce(),
        }
    }
}

impl EngineSettings {
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.state_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger_file)
    }

    pub fn nonce_path(&self) -> PathBuf {
        self.data_dir.join(".last_nonce")
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            sizer: OrderSizer::new(self.safety_margin),
            order_delay: Duration::from_millis(self.order_delay_ms),
            replacement_delay: Duration::from_millis(self.replacement_delay_ms),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            pnl_report_interval: Duration::from_secs(self.pnl_report_interval_secs),
            cancel_all_on_startup: self.cancel_all_on_startup,
            ..RunnerConfig::default()
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_order_delay_ms() -> u64 {
    100
}

fn default_replacement_delay_ms() -> u64 {
    200
}

fn default_pnl_report_interval_secs() -> u64 {
    300
}

fn default_safety_margin() -> f64 {
    0.95
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_state_file() -> String {
    ".expected_order_counts.json".to_string()
}

fn default_ledger_file() -> String {
    "ledger.jsonl".to_string()
}

fn default_persist_nonce() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write log lines to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::with_name(config_path)))
    }

    /// Load settings from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::from_str(contents, FileFormat::Toml)))
    }

    fn build(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let s = builder
            // e.g. APP_ENGINE__POLL_INTERVAL_SECS=5
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_override_option("engine.data_dir", std::env::var("DATA_DIR").ok())?
            .set_override_option(
                "engine.pnl_report_interval_secs",
                std::env::var("PNL_REPORT_INTERVAL").ok(),
            )?
            .build()?;

        s.try_deserialize()
    }

    /// Pairs the engine will trade
    pub fn enabled_pairs(&self) -> Vec<TradingPairConfig> {
        self.pairs.iter().filter(|p| p.enabled).cloned().collect()
    }

    pub fn validate(&self) -> GridResult<()> {
        let mut names = HashSet::new();
        for pair in &self.pairs {
            if !names.insert(pair.name.as_str()) {
                return Err(GridError::InvalidConfig(format!(
                    "duplicate pair name: {}",
                    pair.name
                )));
            }
            if pair.enabled {
                pair.validate()?;
            }
        }

        if !self.pairs.iter().any(|p| p.enabled) {
            return Err(GridError::InvalidConfig("no enabled trading pairs".into()));
        }

        let margin = self.engine.safety_margin;
        if !(margin > 0.0 && margin <= 1.0) {
            return Err(GridError::InvalidConfig(format!(
                "safety_margin must be in (0, 1], got {}",
                margin
            )));
        }

        if self.engine.poll_interval_secs == 0 {
            return Err(GridError::InvalidConfig("poll_interval_secs must be > 0".into()));
        }

        if self.exchange.max_retries == 0 {
            return Err(GridError::InvalidConfig("max_retries must be at least 1".into()));
        }

        Ok(())
    }
}
