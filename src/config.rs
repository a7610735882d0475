// =============================================================================
// Bot Configuration — JSON file, env overrides, fail-fast validation
// =============================================================================
//
// Every field carries a serde default so that partial files load. The file
// is validated once at startup, before any exchange call; a bad value aborts
// the process instead of surfacing mid-loop.
//
// Credentials: `BINANCE_API_KEY` / `BINANCE_API_SECRET` from the environment
// (or `.env`) take precedence over the file's `binance` section.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::hedge::tiers::{default_tiers, DrawdownRule, TierSpec, TierTable};
use crate::types::to_binance_symbol;

/// Tier levels are stored as `u8`.
const MAX_TIERS: usize = u8::MAX as usize;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_amount_usdt() -> Decimal {
    dec!(20)
}

fn default_leverage() -> u32 {
    10
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_monitor_poll_ms() -> u64 {
    150
}

fn default_min_monitor_delay_secs() -> f64 {
    5.0
}

fn default_log_interval_secs() -> f64 {
    5.0
}

fn default_order_fill_timeout_secs() -> f64 {
    5.0
}

fn default_stop_loss_pct() -> f64 {
    1.0
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

// =============================================================================
// Errors
// =============================================================================

/// A configuration value that would make the bot unsafe to start.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no trading pairs configured")]
    NoTradingPairs,

    #[error("trading pair {instrument}: {field} must be positive, got {value}")]
    NonPositiveAmount {
        instrument: String,
        field: &'static str,
        value: Decimal,
    },

    #[error("leverage must be at least 1")]
    ZeroLeverage,

    #[error("{field} must be positive, got {value}")]
    NonPositiveInterval { field: &'static str, value: f64 },

    #[error("stop_loss_pct must be positive, got {0}")]
    NonPositiveStopLoss(f64),

    #[error("trading pairs {first} and {second} both resolve to symbol {symbol}")]
    DuplicateSymbol {
        symbol: String,
        first: String,
        second: String,
    },

    #[error("trailing-stop tier table is empty")]
    EmptyTierTable,

    #[error("trailing-stop tier table has {count} rows, at most {max} are supported")]
    TooManyTiers { count: usize, max: usize },

    #[error("tier {tier}: profit_threshold must be positive, got {threshold}")]
    NonPositiveThreshold { tier: usize, threshold: f64 },

    #[error("tier {tier}: profit_threshold {threshold} must exceed previous tier's {previous}")]
    ThresholdNotAscending {
        tier: usize,
        threshold: f64,
        previous: f64,
    },

    #[error("tier {tier}: proportional fraction must lie in (0, 1), got {fraction}")]
    FractionOutOfRange { tier: usize, fraction: f64 },

    #[error("tier {tier}: fixed drawdown points must be positive, got {points}")]
    NonPositivePoints { tier: usize, points: f64 },

    #[error("max_total_loss_usdt must be negative, got {0}")]
    MaxLossNotNegative(Decimal),

    #[error("min_total_profit_usdt must be positive, got {0}")]
    MinProfitNotPositive(Decimal),
}

// =============================================================================
// Sections
// =============================================================================

/// Per-instrument order sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    #[serde(default = "default_amount_usdt")]
    pub long_amount_usdt: Decimal,
    #[serde(default = "default_amount_usdt")]
    pub short_amount_usdt: Decimal,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            long_amount_usdt: default_amount_usdt(),
            short_amount_usdt: default_amount_usdt(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BinanceConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, alias = "api_secret")]
    pub secret: String,
    #[serde(default)]
    pub testnet: bool,
}

impl std::fmt::Debug for BinanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceConfig")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("testnet", &self.testnet)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossConfig {
    /// Loss (%) beyond which a leg is cut.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Trailing-stop table, ascending by `profit_threshold`.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierSpec>,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            tiers: default_tiers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub binance: BinanceConfig,

    /// Instrument id (`BTCUSDT` or `BTC-USDT-SWAP`) -> sizing.
    #[serde(default)]
    pub trading_pairs: BTreeMap<String, PairConfig>,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    // --- Loop timing ---------------------------------------------------------

    /// Seconds between order-placement passes.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Milliseconds between position-monitor cycles.
    #[serde(default = "default_monitor_poll_ms")]
    pub monitor_poll_ms: u64,

    #[serde(default = "default_min_monitor_delay_secs")]
    pub min_monitor_delay_secs: f64,

    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: f64,

    #[serde(default = "default_order_fill_timeout_secs")]
    pub order_fill_timeout_secs: f64,

    // --- Risk ----------------------------------------------------------------

    #[serde(default)]
    pub stop_loss: StopLossConfig,

    /// Negative cumulative-profit floor that halts trading.
    #[serde(default, alias = "max_total_profit_loss_usdt")]
    pub max_total_loss_usdt: Option<Decimal>,

    /// Positive cumulative-profit target that halts trading.
    #[serde(default)]
    pub min_total_profit_usdt: Option<Decimal>,

    // --- Notifications & API ---------------------------------------------------

    #[serde(default)]
    pub dingtalk_webhook: String,

    #[serde(default = "default_true")]
    pub enable_dingtalk_notification: bool,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            binance: BinanceConfig::default(),
            trading_pairs: BTreeMap::new(),
            leverage: default_leverage(),
            monitor_interval_secs: default_monitor_interval_secs(),
            monitor_poll_ms: default_monitor_poll_ms(),
            min_monitor_delay_secs: default_min_monitor_delay_secs(),
            log_interval_secs: default_log_interval_secs(),
            order_fill_timeout_secs: default_order_fill_timeout_secs(),
            stop_loss: StopLossConfig::default(),
            max_total_loss_usdt: None,
            min_total_profit_usdt: None,
            dingtalk_webhook: String::new(),
            enable_dingtalk_notification: true,
            api: ApiConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = config.trading_pairs.len(),
            leverage = config.leverage,
            stop_loss_pct = config.stop_loss.stop_loss_pct,
            tiers = config.stop_loss.tiers.len(),
            "config loaded"
        );

        Ok(config)
    }

    /// Let `BINANCE_API_KEY` / `BINANCE_API_SECRET` override the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_credentials(
            std::env::var("BINANCE_API_KEY").ok(),
            std::env::var("BINANCE_API_SECRET").ok(),
        );
    }

    fn apply_credentials(&mut self, api_key: Option<String>, secret: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            self.binance.api_key = key;
        }
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            self.binance.secret = secret;
        }
    }

    pub fn tier_table(&self) -> TierTable {
        TierTable::new(self.stop_loss.tiers.clone())
    }

    /// Check every value the engine relies on. Returns the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trading_pairs.is_empty() {
            return Err(ConfigError::NoTradingPairs);
        }
        for (instrument, pair) in &self.trading_pairs {
            for (field, value) in [
                ("long_amount_usdt", pair.long_amount_usdt),
                ("short_amount_usdt", pair.short_amount_usdt),
            ] {
                if value <= Decimal::ZERO {
                    return Err(ConfigError::NonPositiveAmount {
                        instrument: instrument.clone(),
                        field,
                        value,
                    });
                }
            }
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for instrument in self.trading_pairs.keys() {
            let symbol = to_binance_symbol(instrument);
            if let Some(first) = seen.insert(symbol.clone(), instrument) {
                return Err(ConfigError::DuplicateSymbol {
                    symbol,
                    first: first.to_string(),
                    second: instrument.clone(),
                });
            }
        }

        if self.leverage == 0 {
            return Err(ConfigError::ZeroLeverage);
        }

        for (field, value) in [
            ("monitor_interval_secs", self.monitor_interval_secs as f64),
            ("monitor_poll_ms", self.monitor_poll_ms as f64),
            ("order_fill_timeout_secs", self.order_fill_timeout_secs),
            ("log_interval_secs", self.log_interval_secs),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositiveInterval { field, value });
            }
        }
        if !(self.min_monitor_delay_secs >= 0.0) {
            return Err(ConfigError::NonPositiveInterval {
                field: "min_monitor_delay_secs",
                value: self.min_monitor_delay_secs,
            });
        }

        if !(self.stop_loss.stop_loss_pct > 0.0) {
            return Err(ConfigError::NonPositiveStopLoss(self.stop_loss.stop_loss_pct));
        }
        validate_tiers(&self.stop_loss.tiers)?;

        if let Some(limit) = self.max_total_loss_usdt {
            if limit >= Decimal::ZERO {
                return Err(ConfigError::MaxLossNotNegative(limit));
            }
        }
        if let Some(target) = self.min_total_profit_usdt {
            if target <= Decimal::ZERO {
                return Err(ConfigError::MinProfitNotPositive(target));
            }
        }

        Ok(())
    }
}

fn validate_tiers(tiers: &[TierSpec]) -> Result<(), ConfigError> {
    if tiers.is_empty() {
        return Err(ConfigError::EmptyTierTable);
    }
    if tiers.len() > MAX_TIERS {
        return Err(ConfigError::TooManyTiers {
            count: tiers.len(),
            max: MAX_TIERS,
        });
    }

    let mut previous: Option<f64> = None;
    for (idx, spec) in tiers.iter().enumerate() {
        let tier = idx + 1;
        if !(spec.profit_threshold > 0.0) {
            return Err(ConfigError::NonPositiveThreshold {
                tier,
                threshold: spec.profit_threshold,
            });
        }
        if let Some(prev) = previous {
            if spec.profit_threshold <= prev {
                return Err(ConfigError::ThresholdNotAscending {
                    tier,
                    threshold: spec.profit_threshold,
                    previous: prev,
                });
            }
        }
        match spec.drawdown {
            DrawdownRule::Proportional { fraction } if !(fraction > 0.0 && fraction < 1.0) => {
                return Err(ConfigError::FractionOutOfRange { tier, fraction });
            }
            DrawdownRule::Fixed { points } if !(points > 0.0) => {
                return Err(ConfigError::NonPositivePoints { tier, points });
            }
            _ => {}
        }
        previous = Some(spec.profit_threshold);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
