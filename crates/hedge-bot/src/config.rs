//! Configuration for hedge-bot.
//!
//! Supports loading from TOML file with environment variable overrides for
//! credentials. Defaults follow the strategy's reference parameters; every
//! value can be overridden per deployment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Top-level configuration for hedge-bot.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    /// Exchange symbol, e.g. "DOGEUSDC".
    pub symbol: String,

    /// Settlement currency, e.g. "USDC".
    pub quote_asset: String,

    /// Logging level (trace/debug/info/warn/error).
    pub log_level: String,

    /// Exchange endpoints.
    pub exchange: ExchangeConfig,

    /// Credentials for the two accounts.
    pub accounts: AccountsConfig,

    /// ATR channel parameters.
    pub atr: AtrConfig,

    /// Grid construction and admission policy.
    pub grid: GridConfig,

    /// Risk supervision parameters.
    pub risk: RiskConfig,

    /// Optional append-only audit log.
    pub audit: AuditConfig,
}

/// REST/WebSocket endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_base: String,
    pub ws_base: String,
    /// Per-call deadline in seconds.
    pub request_timeout_s: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_base: "https://fapi.binance.com".to_string(),
            ws_base: "wss://fstream.binance.com".to_string(),
            request_timeout_s: 10,
        }
    }
}

/// API credentials for one account.
///
/// Secrets are normally supplied via environment, never the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

/// Credentials for the LONG-side and SHORT-side sessions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    pub long: ApiCredentials,
    pub short: ApiCredentials,
}

/// ATR channel parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AtrConfig {
    /// Periods for RMA smoothing.
    pub length: usize,
    /// Channel half-width in ATRs.
    pub multiplier: Decimal,
    /// OHLC bar size.
    pub timeframe: String,
    /// Bars for the channel high/low.
    pub lookback: usize,
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self {
            length: 14,
            multiplier: dec!(2.0),
            timeframe: "1h".to_string(),
            lookback: 20,
        }
    }
}

/// Grid construction and per-executor admission policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// `spacing = spacing_multiplier * atr`.
    pub spacing_multiplier: Decimal,
    /// Per-side cap on simultaneously resting open orders.
    pub max_open_orders: usize,
    /// Cap on new open orders per control tick.
    pub max_orders_per_batch: usize,
    /// Minimum seconds between order batches.
    pub order_frequency_s: f64,
    /// Only levels within this fraction of mid are eligible.
    pub activation_bounds_pct: Decimal,
    /// Fraction of open-order slots allocated above mid.
    pub upper_lower_ratio: Decimal,
    /// Price nudge applied when a chosen open price would cross the book.
    pub safe_extra_spread: Decimal,
    /// Leverage haircut applied to the theoretical maximum.
    pub safety_factor: Decimal,
    /// Hard cap on usable leverage.
    pub max_leverage_limit: u32,
    /// Fraction of balance committed to the grid.
    pub utilization_ratio: Decimal,
    /// Resting open orders older than this are cancelled.
    pub order_timeout_s: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            spacing_multiplier: dec!(0.26),
            max_open_orders: 4,
            max_orders_per_batch: 2,
            order_frequency_s: 3.0,
            activation_bounds_pct: dec!(0.05),
            upper_lower_ratio: dec!(0.5),
            safe_extra_spread: dec!(0.001),
            safety_factor: dec!(0.8),
            max_leverage_limit: 20,
            utilization_ratio: dec!(0.8),
            order_timeout_s: 600,
        }
    }
}

impl GridConfig {
    /// Minimum wall time between order batches.
    pub fn order_frequency(&self) -> Duration {
        Duration::from_secs_f64(self.order_frequency_s)
    }

    /// Stale-order cancel horizon.
    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_s)
    }
}

/// Risk supervision parameters for the sync controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Risk loop cadence in seconds.
    pub risk_check_interval_s: f64,
    /// Margin ratio on either session beyond which the pair unwinds.
    pub max_margin_ratio: Decimal,
    /// Aggregate unrealized loss (fraction of initial balance) threshold.
    pub max_drawdown_pct: Decimal,
    /// Warn when cross-session balances diverge beyond this fraction.
    pub balance_tolerance_pct: Decimal,
    /// Seconds an executor may report disconnected before the pair drains.
    pub disconnect_grace_s: u64,
    /// Flatten both accounts at start instead of refusing when not flat.
    pub force_flatten_on_start: bool,
    /// Recompute the plan and restart after a channel-breakout unwind.
    pub reset_on_channel_breakout: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_check_interval_s: 1.0,
            max_margin_ratio: dec!(0.8),
            max_drawdown_pct: dec!(0.15),
            balance_tolerance_pct: dec!(0.05),
            disconnect_grace_s: 30,
            force_flatten_on_start: false,
            reset_on_channel_breakout: false,
        }
    }
}

impl RiskConfig {
    pub fn risk_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.risk_check_interval_s)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_s)
    }
}

/// Append-only JSONL audit log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("hedge-events.jsonl"),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// Apply environment variable overrides for credentials.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("LONG_API_KEY") {
            self.accounts.long.api_key = key;
        }
        if let Ok(secret) = std::env::var("LONG_API_SECRET") {
            self.accounts.long.api_secret = secret;
        }
        if let Ok(key) = std::env::var("SHORT_API_KEY") {
            self.accounts.short.api_key = key;
        }
        if let Ok(secret) = std::env::var("SHORT_API_SECRET") {
            self.accounts.short.api_secret = secret;
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("symbol must be set");
        }
        if self.quote_asset.is_empty() {
            bail!("quote_asset must be set");
        }
        if !self.accounts.long.is_complete() {
            bail!("LONG account credentials missing (set LONG_API_KEY / LONG_API_SECRET)");
        }
        if !self.accounts.short.is_complete() {
            bail!("SHORT account credentials missing (set SHORT_API_KEY / SHORT_API_SECRET)");
        }

        if self.atr.length == 0 {
            bail!("atr.length must be at least 1");
        }
        if self.atr.multiplier <= Decimal::ZERO {
            bail!("atr.multiplier must be positive");
        }
        if self.atr.lookback == 0 {
            bail!("atr.lookback must be at least 1");
        }

        if self.grid.spacing_multiplier <= Decimal::ZERO {
            bail!("grid.spacing_multiplier must be positive");
        }
        if self.grid.order_frequency_s <= 0.0 {
            bail!("grid.order_frequency_s must be positive");
        }
        if self.grid.upper_lower_ratio < Decimal::ZERO || self.grid.upper_lower_ratio > Decimal::ONE
        {
            bail!("grid.upper_lower_ratio must be within [0, 1]");
        }
        if self.grid.safety_factor <= Decimal::ZERO || self.grid.safety_factor > Decimal::ONE {
            bail!("grid.safety_factor must be within (0, 1]");
        }
        if self.grid.max_leverage_limit == 0 {
            bail!("grid.max_leverage_limit must be at least 1");
        }
        if self.grid.utilization_ratio <= Decimal::ZERO
            || self.grid.utilization_ratio > Decimal::ONE
        {
            bail!("grid.utilization_ratio must be within (0, 1]");
        }
        if self.grid.activation_bounds_pct < Decimal::ZERO {
            bail!("grid.activation_bounds_pct must not be negative");
        }

        if self.risk.risk_check_interval_s <= 0.0 {
            bail!("risk.risk_check_interval_s must be positive");
        }
        if self.risk.max_margin_ratio <= Decimal::ZERO || self.risk.max_margin_ratio >= Decimal::ONE
        {
            bail!("risk.max_margin_ratio must be within (0, 1)");
        }
        if self.risk.max_drawdown_pct <= Decimal::ZERO || self.risk.max_drawdown_pct >= Decimal::ONE
        {
            bail!("risk.max_drawdown_pct must be within (0, 1)");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BotConfig {
        let mut config = BotConfig {
            symbol: "DOGEUSDC".to_string(),
            quote_asset: "USDC".to_string(),
            ..BotConfig::default()
        };
        config.accounts.long = ApiCredentials {
            api_key: "lk".into(),
            api_secret: "ls".into(),
        };
        config.accounts.short = ApiCredentials {
            api_key: "sk".into(),
            api_secret: "ss".into(),
        };
        config
    }

    #[test]
    fn test_defaults_match_reference_parameters() {
        let config = BotConfig::default();
        assert_eq!(config.atr.length, 14);
        assert_eq!(config.atr.multiplier, dec!(2.0));
        assert_eq!(config.atr.timeframe, "1h");
        assert_eq!(config.atr.lookback, 20);
        assert_eq!(config.grid.spacing_multiplier, dec!(0.26));
        assert_eq!(config.grid.max_open_orders, 4);
        assert_eq!(config.grid.max_orders_per_batch, 2);
        assert_eq!(config.grid.order_frequency_s, 3.0);
        assert_eq!(config.grid.activation_bounds_pct, dec!(0.05));
        assert_eq!(config.grid.upper_lower_ratio, dec!(0.5));
        assert_eq!(config.grid.safety_factor, dec!(0.8));
        assert_eq!(config.grid.max_leverage_limit, 20);
        assert_eq!(config.grid.utilization_ratio, dec!(0.8));
        assert_eq!(config.grid.order_timeout_s, 600);
        assert_eq!(config.risk.max_margin_ratio, dec!(0.8));
        assert_eq!(config.risk.max_drawdown_pct, dec!(0.15));
        assert_eq!(config.risk.balance_tolerance_pct, dec!(0.05));
        assert!(!config.risk.force_flatten_on_start);
        assert!(!config.risk.reset_on_channel_breakout);
    }

    #[test]
    fn test_toml_roundtrip_with_partial_sections() {
        let config = BotConfig::from_toml_str(
            r#"
            symbol = "DOGEUSDC"
            quote_asset = "USDC"

            [grid]
            spacing_multiplier = "0.30"
            max_open_orders = 6

            [risk]
            reset_on_channel_breakout = true
            "#,
        )
        .unwrap();

        assert_eq!(config.symbol, "DOGEUSDC");
        assert_eq!(config.grid.spacing_multiplier, dec!(0.30));
        assert_eq!(config.grid.max_open_orders, 6);
        // Untouched fields keep their defaults.
        assert_eq!(config.grid.max_orders_per_batch, 2);
        assert!(config.risk.reset_on_channel_breakout);
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.accounts.short.api_secret.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("SHORT account"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_bad_ratios() {
        let mut config = valid_config();
        config.grid.upper_lower_ratio = dec!(1.5);
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.grid.safety_factor = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.risk.max_drawdown_pct = Decimal::ONE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_credentials() {
        let mut config = valid_config();
        // Serialized access: env vars are process-global.
        std::env::set_var("LONG_API_KEY", "env-long-key");
        config.apply_env_overrides();
        std::env::remove_var("LONG_API_KEY");
        assert_eq!(config.accounts.long.api_key, "env-long-key");
    }

    #[test]
    fn test_duration_helpers() {
        let config = BotConfig::default();
        assert_eq!(config.grid.order_frequency(), Duration::from_secs(3));
        assert_eq!(config.grid.order_timeout(), Duration::from_secs(600));
        assert_eq!(config.risk.risk_check_interval(), Duration::from_secs(1));
    }
}
