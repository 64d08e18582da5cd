mod account;
mod exchange;

pub use account::{AccountId, AccountRole};
pub use exchange::ExchangeId;

use thiserror::Error;

/// Failure to parse an exchange or account identifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseIdentityError {
    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Malformed account id: {0}")]
    MalformedAccount(String),
}
