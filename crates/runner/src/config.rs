//! Engine configuration
//!
//! One JSON document describes the run: cycle timing, nonce and retry
//! settings, the risk governor, per-exchange trading rules and the accounts
//! to trade. Every numeric threshold lives here, not in code.

use meridian_core::{AccountId, AccountRole, ExchangeId, Symbol, Timeframe};
use meridian_gateway::{ExchangeRules, RetryPolicy, SyntheticFeed, VerifyPolicy};
use meridian_nonce::NonceConfig;
use meridian_order_manager::ExitRules;
use meridian_risk_manager::GovernorConfig;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Where orders go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Real exchanges, credentials from the environment
    #[default]
    Live,
    /// Every account backed by the in-process paper venue
    Paper,
}

/// Retry, timeout and fill-verification settings shared by every adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    pub request_timeout_ms: u64,
    pub verify_window_ms: u64,
    pub verify_polls: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let verify = VerifyPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            jitter_ratio: retry.jitter_ratio,
            request_timeout_ms: retry.request_timeout_ms,
            verify_window_ms: verify.window_ms,
            verify_polls: verify.polls,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_ratio: self.jitter_ratio,
            request_timeout_ms: self.request_timeout_ms,
        }
    }

    pub fn verify(&self) -> VerifyPolicy {
        VerifyPolicy {
            window_ms: self.verify_window_ms,
            polls: self.verify_polls,
        }
    }
}

/// Paper venue settings, used when `mode` is `paper`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    pub starting_cash: Decimal,
    pub cash_asset: String,
    /// Per-side fee; half the exchange's round-trip fee when absent
    pub fee_pct: Option<Decimal>,
    /// Random-walk market; without it prices only move when set by hand
    pub synthetic_feed: Option<SyntheticFeed>,
    pub latency_ms: u64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            starting_cash: dec!(1000),
            cash_asset: "USD".to_string(),
            fee_pct: None,
            synthetic_feed: Some(SyntheticFeed::default()),
            latency_ms: 0,
        }
    }
}

fn default_min_balance() -> Decimal {
    dec!(25)
}

fn default_min_notional() -> Decimal {
    dec!(10)
}

fn default_quotes() -> Vec<String> {
    vec!["USD".to_string(), "USDT".to_string(), "USDC".to_string()]
}

/// Trading rules for one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSettings {
    pub exchange: ExchangeId,
    /// Watchlist traded on every account of this exchange
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    /// Accounts with less quote cash are not traded
    #[serde(default = "default_min_balance")]
    pub min_balance_to_trade: Decimal,
    #[serde(default = "default_min_notional")]
    pub min_order_notional: Decimal,
    /// Overrides the fee in `exit_rules` when present
    #[serde(default)]
    pub round_trip_fee_pct: Option<Decimal>,
    #[serde(default = "default_quotes")]
    pub supported_quotes: Vec<String>,
    #[serde(default)]
    pub allow_short: bool,
    #[serde(default)]
    pub exit_rules: ExitRules,
    /// Override of the production endpoint
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ExchangeSettings {
    pub fn new(exchange: ExchangeId, symbols: Vec<Symbol>) -> Self {
        Self {
            exchange,
            symbols,
            min_balance_to_trade: default_min_balance(),
            min_order_notional: default_min_notional(),
            round_trip_fee_pct: None,
            supported_quotes: default_quotes(),
            allow_short: false,
            exit_rules: ExitRules::default(),
            base_url: None,
        }
    }

    pub fn rules(&self) -> ExchangeRules {
        ExchangeRules {
            exchange: self.exchange,
            min_order_notional: self.min_order_notional,
            supported_quotes: self
                .supported_quotes
                .iter()
                .map(|q| q.to_ascii_uppercase())
                .collect(),
            allow_short: self.allow_short,
        }
    }

    pub fn exit_rules(&self) -> ExitRules {
        let mut rules = self.exit_rules.clone();
        if let Some(fee) = self.round_trip_fee_pct {
            rules.round_trip_fee_pct = fee;
        }
        rules
    }
}

/// One account to trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub exchange: ExchangeId,
    pub role: AccountRole,
}

impl AccountEntry {
    pub fn id(&self) -> AccountId {
        AccountId::new(self.exchange, self.role.clone())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cycle_interval_secs: u64,
    pub mode: RunMode,
    pub candle_timeframe: Timeframe,
    pub candle_count: usize,
    /// How long an unconfirmed order may stay open before it is canceled
    pub pending_expiry_minutes: u64,
    pub nonce: NonceConfig,
    pub retry: RetrySettings,
    pub risk: GovernorConfig,
    pub paper: PaperSettings,
    pub exchanges: Vec<ExchangeSettings>,
    pub accounts: Vec<AccountEntry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 150,
            mode: RunMode::Live,
            candle_timeframe: Timeframe::FiveMinutes,
            candle_count: 100,
            pending_expiry_minutes: 30,
            nonce: NonceConfig::default(),
            retry: RetrySettings::default(),
            risk: GovernorConfig::default(),
            paper: PaperSettings::default(),
            exchanges: Vec::new(),
            accounts: Vec::new(),
        }
    }
}

/// Load engine configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Load configuration from a JSON string
pub fn load_config_from_str(json: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(json)?;
    Ok(config)
}

impl EngineConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn pending_expiry(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.pending_expiry_minutes as i64)
    }

    pub fn exchange(&self, exchange: ExchangeId) -> Option<&ExchangeSettings> {
        self.exchanges.iter().find(|e| e.exchange == exchange)
    }

    /// Configured accounts as identities, in file order
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.iter().map(AccountEntry::id).collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }
        if self.cycle_interval_secs == 0 {
            return Err(ConfigError::Invalid("cycle_interval_secs must be positive".into()));
        }
        if self.candle_count <= self.risk.mode.atr_period {
            return Err(ConfigError::Invalid(format!(
                "candle_count {} must exceed the ATR period {}",
                self.candle_count, self.risk.mode.atr_period
            )));
        }
        self.risk.validate()?;

        let mut exchanges = HashSet::new();
        for settings in &self.exchanges {
            if !exchanges.insert(settings.exchange) {
                return Err(ConfigError::DuplicateExchange(settings.exchange));
            }
            settings
                .exit_rules()
                .validate()
                .map_err(|source| ConfigError::ExitRules {
                    exchange: settings.exchange,
                    source,
                })?;
            let rules = settings.rules();
            if let Some(symbol) = settings
                .symbols
                .iter()
                .find(|s| !rules.supports_quote(s.quote()))
            {
                return Err(ConfigError::Invalid(format!(
                    "{} is not supported on {}",
                    symbol, settings.exchange
                )));
            }
            if settings.min_order_notional <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "min_order_notional for {} must be positive",
                    settings.exchange
                )));
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.accounts {
            let id = entry.id();
            if !exchanges.contains(&entry.exchange) {
                return Err(ConfigError::UnknownExchange(id));
            }
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateAccount(id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "cycle_interval_secs": 150,
        "mode": "live",
        "candle_timeframe": "5m",
        "candle_count": 100,
        "nonce": { "safety_offset_secs": 30, "recovery_jump_secs": 60 },
        "retry": { "max_attempts": 4, "base_delay_ms": 500, "max_delay_ms": 8000,
                   "jitter_ratio": 0.3, "request_timeout_ms": 15000,
                   "verify_window_ms": 2000, "verify_polls": 4 },
        "exchanges": [ { "exchange": "kraken", "symbols": ["BTC-USD", "ETH-USD"],
                         "min_balance_to_trade": "25", "min_order_notional": "10",
                         "round_trip_fee_pct": "0.52", "supported_quotes": ["USD", "USDT"],
                         "allow_short": false, "base_url": null } ],
        "accounts": [ { "exchange": "kraken", "role": "master" },
                      { "exchange": "kraken", "role": { "user": "alice" } } ]
    }"#;

    #[test]
    fn test_shipped_paper_config_is_valid() {
        let config =
            load_config_from_str(include_str!("../../../config/meridian.paper.json")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, RunMode::Paper);
        assert_eq!(config.accounts.len(), 3);
        let coinbase = config.exchange(ExchangeId::Coinbase).unwrap();
        assert_eq!(coinbase.exit_rules().round_trip_fee_pct, dec!(1.2));
    }

    #[test]
    fn test_load_sample_config() {
        let config = load_config_from_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, RunMode::Live);
        assert_eq!(config.candle_timeframe, Timeframe::FiveMinutes);
        assert_eq!(
            config.account_ids(),
            vec![
                AccountId::master(ExchangeId::Kraken),
                AccountId::user(ExchangeId::Kraken, "alice")
            ]
        );

        let kraken = config.exchange(ExchangeId::Kraken).unwrap();
        assert_eq!(kraken.symbols[1], Symbol::new("ETH", "USD"));
        assert_eq!(kraken.exit_rules().round_trip_fee_pct, dec!(0.52));
        assert_eq!(kraken.rules().min_order_notional, dec!(10));
        assert_eq!(config.retry.verify().window_ms, 2000);
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let mut config = load_config_from_str(SAMPLE).unwrap();
        config.accounts.push(AccountEntry {
            exchange: ExchangeId::Kraken,
            role: AccountRole::Master,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateAccount(id)) if id == AccountId::master(ExchangeId::Kraken)
        ));
    }

    #[test]
    fn test_account_needs_exchange_settings() {
        let mut config = load_config_from_str(SAMPLE).unwrap();
        config.accounts.push(AccountEntry {
            exchange: ExchangeId::Okx,
            role: AccountRole::Master,
        });
        assert!(matches!(config.validate(), Err(ConfigError::UnknownExchange(_))));
    }

    #[test]
    fn test_unsupported_watchlist_quote_rejected() {
        let mut config = load_config_from_str(SAMPLE).unwrap();
        config.exchanges[0].symbols.push(Symbol::new("BTC", "EUR"));
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Invalid config: BTC-EUR is not supported on kraken");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            load_config("/nonexistent/meridian.json"),
            Err(ConfigError::IoError(_))
        ));
    }

    #[test]
    fn test_defaults_fill_gaps() {
        let config = load_config_from_str(
            r#"{ "exchanges": [ { "exchange": "coinbase", "symbols": ["SOL-USD"] } ],
                 "accounts": [ { "exchange": "coinbase", "role": "master" } ] }"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.cycle_interval_secs, 150);
        assert_eq!(config.exchanges[0].min_balance_to_trade, dec!(25));
        assert!(config.paper.synthetic_feed.is_some());
    }
}
