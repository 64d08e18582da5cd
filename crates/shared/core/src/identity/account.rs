use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ExchangeId, ParseIdentityError};

/// Who an account trades for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    /// The operator's own account
    Master,
    /// A user account, identified by a configuration-assigned id
    User(String),
}

impl AccountRole {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// One (exchange, role) pair. There is exactly one account per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId {
    pub exchange: ExchangeId,
    pub role: AccountRole,
}

impl AccountId {
    pub fn new(exchange: ExchangeId, role: AccountRole) -> Self {
        Self { exchange, role }
    }

    pub fn master(exchange: ExchangeId) -> Self {
        Self::new(exchange, AccountRole::Master)
    }

    pub fn user(exchange: ExchangeId, id: impl Into<String>) -> Self {
        Self::new(exchange, AccountRole::user(id))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.role)
    }
}

impl FromStr for AccountId {
    type Err = ParseIdentityError;

    /// Parses `kraken:master` or `kraken:user:alice`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let exchange = parts
            .next()
            .ok_or_else(|| ParseIdentityError::MalformedAccount(s.to_string()))?
            .parse::<ExchangeId>()?;

        let role = match (parts.next(), parts.next()) {
            (Some("master"), None) => AccountRole::Master,
            (Some("user"), Some(id)) if !id.is_empty() => AccountRole::user(id),
            _ => return Err(ParseIdentityError::MalformedAccount(s.to_string())),
        };

        Ok(Self { exchange, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let master = AccountId::master(ExchangeId::Kraken);
        assert_eq!(master.to_string(), "kraken:master");
        assert_eq!("kraken:master".parse::<AccountId>().unwrap(), master);

        let user = AccountId::user(ExchangeId::Coinbase, "alice");
        assert_eq!(user.to_string(), "coinbase:user:alice");
        assert_eq!("coinbase:user:alice".parse::<AccountId>().unwrap(), user);
    }

    #[test]
    fn test_malformed() {
        assert!("kraken".parse::<AccountId>().is_err());
        assert!("kraken:user:".parse::<AccountId>().is_err());
        assert!("kraken:admin".parse::<AccountId>().is_err());
    }

    #[test]
    fn test_role_deserializes_from_config_shape() {
        let role: AccountRole = serde_json::from_str(r#""master""#).unwrap();
        assert!(role.is_master());

        let role: AccountRole = serde_json::from_str(r#"{"user":"bob"}"#).unwrap();
        assert_eq!(role, AccountRole::user("bob"));
    }
}
