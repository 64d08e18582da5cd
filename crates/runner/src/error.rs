//! Runner errors

use meridian_core::{AccountId, ExchangeId};
use meridian_risk_manager::RiskError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("No accounts in config")]
    NoAccounts,
    #[error("Account {0} is configured more than once")]
    DuplicateAccount(AccountId),
    #[error("Exchange {0} is configured more than once")]
    DuplicateExchange(ExchangeId),
    #[error("Account {0} has no settings for its exchange")]
    UnknownExchange(AccountId),
    #[error("Invalid exit rules for {exchange}: {source}")]
    ExitRules {
        exchange: ExchangeId,
        source: meridian_order_manager::Error,
    },
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No funded accounts to trade")]
    NoFundedAccounts,
    #[error("Failed to set up {account}: {reason}")]
    Setup { account: AccountId, reason: String },
}
