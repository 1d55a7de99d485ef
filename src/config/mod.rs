//! Startup configuration
//!
//! Layered the usual way: built-in defaults, then an optional TOML file, then
//! `TRADELOOP__SECTION__KEY` environment variables. Loaded once; nothing in the
//! engine mutates it afterwards.
//!
//! The `config` crate lowercases keys before deserializing, so every camelCase
//! alias is paired with its lowercased form. Unknown keys are rejected.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Timeframe;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub trading: TradingSettings,
    pub risk: RiskLimits,
    pub cache: CacheSettings,
    pub health: HealthSettings,
    pub execution: ExecutionSettings,
    pub strategy: StrategySettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// In-memory simulated exchange
    Paper,
    /// JSON REST exchange API
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeSettings {
    pub kind: ExchangeKind,
    pub name: String,
    pub base_url: String,
    pub sandbox_url: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(alias = "sandboxMode", alias = "sandboxmode")]
    pub sandbox_mode: bool,
    pub requests_per_second: u32,
    pub call_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    /// Paper exchange only: fraction of each market order that fills
    pub paper_fill_ratio: f64,
    /// Paper exchange only: emulate native OCO brackets
    pub paper_conditional_orders: bool,
    pub paper_seed: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Paper,
            name: "paper".to_string(),
            base_url: "https://api.exchange.example".to_string(),
            sandbox_url: "https://testnet.exchange.example".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            sandbox_mode: true,
            requests_per_second: 10,
            call_timeout_secs: 10,
            max_retries: 3,
            retry_base_ms: 500,
            paper_fill_ratio: 1.0,
            paper_conditional_orders: false,
            paper_seed: 42,
        }
    }
}

impl ExchangeSettings {
    /// Endpoint selected by `sandbox_mode`
    pub fn endpoint(&self) -> &str {
        if self.sandbox_mode {
            &self.sandbox_url
        } else {
            &self.base_url
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TradingSettings {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    /// Bars requested per fetch
    pub candle_limit: usize,
    /// Delay after the candle close before the cycle runs
    pub settle_delay_secs: u64,
    /// Fixed cycle period; when unset the cycle aligns to candle closes
    pub cycle_interval_secs: Option<u64>,
    /// Starting cash for the paper exchange
    pub initial_balance: f64,
    pub quote_currency: String,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            timeframe: Timeframe::M5,
            candle_limit: 100,
            settle_delay_secs: 5,
            cycle_interval_secs: None,
            initial_balance: 10_000.0,
            quote_currency: "USDT".to_string(),
        }
    }
}

/// Portfolio and per-trade limits enforced by the risk manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RiskLimits {
    /// Cap on one position's notional as a fraction of equity
    #[serde(alias = "maxPositionSizeFraction", alias = "maxpositionsizefraction")]
    pub max_position_size_fraction: f64,
    #[serde(alias = "maxConcurrentPositions", alias = "maxconcurrentpositions")]
    pub max_concurrent_positions: usize,
    /// At most one open position per symbol
    #[serde(alias = "maxConcurrentPositionsPerSymbol", alias = "maxconcurrentpositionspersymbol")]
    pub max_positions_per_symbol_enabled: bool,
    /// Peak-to-trough equity drawdown that trips the circuit breaker
    #[serde(alias = "maxPortfolioDrawdown", alias = "maxportfoliodrawdown")]
    pub max_portfolio_drawdown: f64,
    /// Drawdown at or below which a tripped breaker resets
    #[serde(alias = "drawdownRecoveryThreshold", alias = "drawdownrecoverythreshold")]
    pub drawdown_recovery_threshold: f64,
    /// Loss from start-of-day equity that halts entries until the next UTC day
    #[serde(alias = "maxDailyLoss", alias = "maxdailyloss")]
    pub max_daily_loss: f64,
    #[serde(alias = "riskFractionPerTrade", alias = "riskfractionpertrade")]
    pub risk_fraction_per_trade: f64,
    /// Sum of open position risk as a fraction of equity
    #[serde(alias = "maxPortfolioHeat", alias = "maxportfolioheat")]
    pub max_portfolio_heat: f64,
    /// Take-profit distance as a multiple of the stop distance
    pub default_reward_risk: f64,
    pub atr_period: usize,
    pub atr_stop_multiplier: f64,
    /// Stop distance as a fraction of price when no ATR is available
    pub fallback_stop_fraction: f64,
    pub allow_short: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_fraction: 0.25,
            max_concurrent_positions: 3,
            max_positions_per_symbol_enabled: true,
            max_portfolio_drawdown: 0.20,
            drawdown_recovery_threshold: 0.10,
            max_daily_loss: 0.05,
            risk_fraction_per_trade: 0.01,
            max_portfolio_heat: 0.06,
            default_reward_risk: 2.0,
            atr_period: 14,
            atr_stop_multiplier: 2.0,
            fallback_stop_fraction: 0.02,
            allow_short: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(alias = "cacheMaxEntries", alias = "cachemaxentries")]
    pub max_entries: usize,
    #[serde(alias = "cacheMaxAgeSeconds", alias = "cachemaxageseconds")]
    pub max_age_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 50,
            max_age_secs: 60,
        }
    }
}

impl CacheSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    #[serde(alias = "healthCheckIntervalSeconds", alias = "healthcheckintervalseconds")]
    pub interval_secs: u64,
    pub memory_threshold: f64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    #[serde(alias = "maxRestartsPerHour", alias = "maxrestartsperhour")]
    pub max_restarts_per_hour: usize,
    pub restart_window_secs: u64,
    /// Pause before relaunching a failed run
    pub restart_delay_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            memory_threshold: 0.85,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            max_restarts_per_hour: 5,
            restart_window_secs: 3_600,
            restart_delay_ms: 5_000,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSettings {
    /// How long an entry may stay unfilled before the remainder is cancelled
    pub fill_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub client_id_prefix: String,
    /// Resubmissions of the same client id after a transient failure
    pub max_submit_retries: u32,
    /// Trailing-stop distance in price units; unset disables trailing
    pub trailing_stop_distance: Option<f64>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            fill_timeout_secs: 30,
            poll_interval_ms: 500,
            client_id_prefix: "tl".to_string(),
            max_submit_retries: 3,
            trailing_stop_distance: None,
        }
    }
}

impl ExecutionSettings {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Hold,
    SmaCross,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategySettings {
    pub kind: StrategyKind,
    pub fast_period: usize,
    pub slow_period: usize,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            kind: StrategyKind::SmaCross,
            fast_period: 9,
            slow_period: 21,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Log,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceSettings {
    pub kind: JournalKind,
    pub database_url: Option<String>,
    /// Mirrors the restart ledger so a re-executed binary sees earlier restarts
    pub redis_url: Option<String>,
    pub queue_capacity: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            kind: JournalKind::Log,
            database_url: None,
            redis_url: None,
            queue_capacity: 1_024,
        }
    }
}

impl Settings {
    /// Load defaults, then `path` (if any), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("TRADELOOP")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("trading.symbols")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let risk = &self.risk;

        check_fraction("risk.max_position_size_fraction", risk.max_position_size_fraction)?;
        check_fraction("risk.max_portfolio_drawdown", risk.max_portfolio_drawdown)?;
        check_fraction("risk.max_daily_loss", risk.max_daily_loss)?;
        check_fraction("risk.risk_fraction_per_trade", risk.risk_fraction_per_trade)?;
        check_fraction("risk.max_portfolio_heat", risk.max_portfolio_heat)?;
        check_fraction("risk.fallback_stop_fraction", risk.fallback_stop_fraction)?;
        check_fraction("health.memory_threshold", self.health.memory_threshold)?;

        if !(0.0..risk.max_portfolio_drawdown).contains(&risk.drawdown_recovery_threshold) {
            return Err(invalid(format!(
                "risk.drawdown_recovery_threshold ({}) must be in [0, max_portfolio_drawdown ({}))",
                risk.drawdown_recovery_threshold, risk.max_portfolio_drawdown
            )));
        }
        if risk.max_concurrent_positions == 0 {
            return Err(invalid("risk.max_concurrent_positions must be at least 1"));
        }
        if risk.default_reward_risk <= 0.0 || risk.atr_stop_multiplier <= 0.0 {
            return Err(invalid("risk reward/ATR multipliers must be positive"));
        }
        if self.trading.symbols.is_empty() {
            return Err(invalid("trading.symbols must not be empty"));
        }
        if self.trading.candle_limit == 0 {
            return Err(invalid("trading.candle_limit must be at least 1"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be at least 1"));
        }
        if self.health.interval_secs == 0 {
            return Err(invalid("health.interval_secs must be at least 1"));
        }
        if self.health.reconnect_base_ms == 0
            || self.health.reconnect_max_ms < self.health.reconnect_base_ms
        {
            return Err(invalid(
                "health.reconnect_base_ms must be positive and not above reconnect_max_ms",
            ));
        }
        if self.exchange.requests_per_second == 0 {
            return Err(invalid("exchange.requests_per_second must be at least 1"));
        }
        if !(self.exchange.paper_fill_ratio > 0.0 && self.exchange.paper_fill_ratio <= 1.0) {
            return Err(invalid("exchange.paper_fill_ratio must be in (0, 1]"));
        }
        if let Some(trail) = self.execution.trailing_stop_distance {
            if !(trail.is_finite() && trail > 0.0) {
                return Err(invalid("execution.trailing_stop_distance must be positive"));
            }
        }
        if self.strategy.kind == StrategyKind::SmaCross
            && (self.strategy.fast_period == 0 || self.strategy.fast_period >= self.strategy.slow_period)
        {
            return Err(invalid("strategy.fast_period must be positive and below slow_period"));
        }
        if self.exchange.kind == ExchangeKind::Http && self.exchange.api_key.is_empty() {
            return Err(invalid("exchange.api_key is required for the http exchange"));
        }
        if self.persistence.kind == JournalKind::Postgres && self.persistence.database_url.is_none() {
            return Err(invalid("persistence.database_url is required for the postgres journal"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn check_fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} must be in (0, 1], got {}", name, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.cache.max_entries, 50);
        assert_eq!(settings.health.interval_secs, 30);
        assert_eq!(settings.health.max_restarts_per_hour, 5);
    }

    #[test]
    fn test_recovery_threshold_must_sit_below_trip_level() {
        let mut settings = Settings::default();
        settings.risk.drawdown_recovery_threshold = settings.risk.max_portfolio_drawdown;

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("drawdown_recovery_threshold"));
    }

    #[test]
    fn test_rejects_out_of_range_fraction() {
        let mut settings = Settings::default();
        settings.risk.risk_fraction_per_trade = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_http_exchange_needs_credentials() {
        let mut settings = Settings::default();
        settings.exchange.kind = ExchangeKind::Http;
        assert!(settings.validate().is_err());

        settings.exchange.api_key = "key".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_sandbox_selects_endpoint() {
        let mut exchange = ExchangeSettings::default();
        assert_eq!(exchange.endpoint(), exchange.sandbox_url);
        exchange.sandbox_mode = false;
        assert_eq!(exchange.endpoint(), exchange.base_url);
    }

    /// Write `contents` to a fresh settings file; returns its directory and path
    fn settings_file(contents: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("tradeloop-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_camel_case_option_names_are_applied() {
        let (dir, path) = settings_file(
            r#"
[exchange]
sandboxMode = false

[risk]
maxConcurrentPositions = 2
maxConcurrentPositionsPerSymbol = false
maxPortfolioDrawdown = 0.3
drawdownRecoveryThreshold = 0.12
riskFractionPerTrade = 0.02
maxPositionSizeFraction = 0.4
maxDailyLoss = 0.07
maxPortfolioHeat = 0.08

[cache]
cacheMaxEntries = 7
cacheMaxAgeSeconds = 90

[health]
healthCheckIntervalSeconds = 15
maxRestartsPerHour = 2
"#,
        );

        let settings = Settings::load(Some(&path)).unwrap();
        assert!(!settings.exchange.sandbox_mode);
        assert_eq!(settings.risk.max_concurrent_positions, 2);
        assert!(!settings.risk.max_positions_per_symbol_enabled);
        assert_eq!(settings.risk.max_portfolio_drawdown, 0.3);
        assert_eq!(settings.risk.drawdown_recovery_threshold, 0.12);
        assert_eq!(settings.risk.risk_fraction_per_trade, 0.02);
        assert_eq!(settings.risk.max_position_size_fraction, 0.4);
        assert_eq!(settings.risk.max_daily_loss, 0.07);
        assert_eq!(settings.risk.max_portfolio_heat, 0.08);
        assert_eq!(settings.cache.max_entries, 7);
        assert_eq!(settings.cache.max_age_secs, 90);
        assert_eq!(settings.health.interval_secs, 15);
        assert_eq!(settings.health.max_restarts_per_hour, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let (dir, path) = settings_file(
            r#"
[risk]
riskFractionPerTrad = 0.02
"#,
        );

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
        assert!(err.to_string().to_lowercase().contains("riskfractionpertrad"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_from_toml_file() {
        let (dir, path) = settings_file(
            r#"
[trading]
symbols = ["ETHUSDT", "SOLUSDT"]
timeframe = "15m"

[risk]
max_concurrent_positions = 2
risk_fraction_per_trade = 0.02

[cache]
max_entries = 10
"#,
        );

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.trading.symbols, vec!["ETHUSDT", "SOLUSDT"]);
        assert_eq!(settings.trading.timeframe, Timeframe::M15);
        assert_eq!(settings.risk.max_concurrent_positions, 2);
        assert_eq!(settings.risk.risk_fraction_per_trade, 0.02);
        assert_eq!(settings.cache.max_entries, 10);
        // Untouched sections keep their defaults
        assert_eq!(settings.health.interval_secs, 30);

        std::fs::remove_dir_all(&dir).ok();
    }
}
