use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseIdentityError;

/// Exchanges the execution core can trade on
///
/// This is a closed set: adapters are selected from it once, when an account
/// is constructed, so the hot path never branches on exchange-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Coinbase,
    Kraken,
    Binance,
    Okx,
}

impl ExchangeId {
    pub const ALL: [ExchangeId; 4] = [
        ExchangeId::Coinbase,
        ExchangeId::Kraken,
        ExchangeId::Binance,
        ExchangeId::Okx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coinbase => "coinbase",
            Self::Kraken => "kraken",
            Self::Binance => "binance",
            Self::Okx => "okx",
        }
    }

    /// True when the exchange validates a client-supplied nonce on every
    /// private request (the others authenticate with a timestamp).
    pub fn validates_nonce(&self) -> bool {
        matches!(self, Self::Kraken)
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coinbase" => Ok(Self::Coinbase),
            "kraken" => Ok(Self::Kraken),
            "binance" => Ok(Self::Binance),
            "okx" => Ok(Self::Okx),
            other => Err(ParseIdentityError::UnknownExchange(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_str() {
        for exchange in ExchangeId::ALL {
            assert_eq!(exchange.as_str().parse::<ExchangeId>().unwrap(), exchange);
        }
        assert_eq!(" Kraken ".parse::<ExchangeId>().unwrap(), ExchangeId::Kraken);
    }

    #[test]
    fn test_unknown_exchange() {
        assert_eq!(
            "ftx".parse::<ExchangeId>(),
            Err(ParseIdentityError::UnknownExchange("ftx".to_string()))
        );
    }

    #[test]
    fn test_only_kraken_validates_nonce() {
        assert!(ExchangeId::Kraken.validates_nonce());
        assert!(!ExchangeId::Coinbase.validates_nonce());
    }
}
