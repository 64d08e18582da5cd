//! Error types for the gateway crate

use meridian_core::{ExchangeId, Symbol};
use rust_decimal::Decimal;
use thiserror::Error;

/// How the caller should treat a failed broker call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Worth retrying with backoff
    Transient,
    /// Retrying cannot help (credentials, funds, validation)
    Permanent,
    /// The request may have reached the exchange; state must be verified
    Unverified,
}

/// Broker call failure, classified once when the response is parsed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("{symbol} is not supported on {exchange}")]
    UnsupportedPair { symbol: Symbol, exchange: ExchangeId },

    #[error("order ${notional} below exchange minimum ${minimum}")]
    BelowMinimum { notional: Decimal, minimum: Decimal },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Response could not be parsed: {0}")]
    Parse(String),

    #[error("Order submission unverified: {0}")]
    Unverified(String),

    #[error("Not connected to {0}")]
    NotConnected(ExchangeId),
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BrokerError::Timeout(_)
            | BrokerError::Connection(_)
            | BrokerError::RateLimited(_)
            | BrokerError::ServiceUnavailable(_)
            | BrokerError::InvalidNonce(_)
            | BrokerError::NotConnected(_) => ErrorClass::Transient,
            BrokerError::Unverified(_) => ErrorClass::Unverified,
            BrokerError::Authentication(_)
            | BrokerError::PermissionDenied(_)
            | BrokerError::InsufficientFunds(_)
            | BrokerError::UnsupportedPair { .. }
            | BrokerError::BelowMinimum { .. }
            | BrokerError::InvalidRequest(_)
            | BrokerError::Rejected(_)
            | BrokerError::Parse(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Reclassify a failure seen after an order was transmitted
    ///
    /// An answer that cannot be read says nothing about whether the order
    /// was accepted.
    pub fn after_submission(self) -> Self {
        match self {
            BrokerError::Parse(msg) => BrokerError::Unverified(format!("unreadable response: {msg}")),
            other => other,
        }
    }

    /// The request may have been executed even though no answer arrived
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_) | BrokerError::Connection(_) | BrokerError::Unverified(_)
        )
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrokerError::Timeout(err.to_string())
        } else if err.is_decode() {
            BrokerError::Parse(err.to_string())
        } else if err.is_builder() {
            BrokerError::InvalidRequest(err.to_string())
        } else {
            BrokerError::Connection(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Parse(err.to_string())
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_below_minimum_message() {
        let err = BrokerError::BelowMinimum {
            notional: dec!(4.50),
            minimum: dec!(10),
        };
        assert_eq!(err.to_string(), "order $4.50 below exchange minimum $10");
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_classes() {
        assert!(BrokerError::RateLimited("429".into()).is_transient());
        assert!(BrokerError::InvalidNonce("EAPI:Invalid nonce".into()).is_transient());
        assert!(!BrokerError::Authentication("bad key".into()).is_transient());
        assert!(!BrokerError::InsufficientFunds("".into()).is_transient());
        assert_eq!(
            BrokerError::Unverified("lost ack".into()).class(),
            ErrorClass::Unverified
        );
    }

    #[test]
    fn test_ambiguity() {
        assert!(BrokerError::Timeout("".into()).is_ambiguous());
        assert!(BrokerError::Connection("reset".into()).is_ambiguous());
        assert!(!BrokerError::RateLimited("".into()).is_ambiguous());
        assert!(!BrokerError::Rejected("".into()).is_ambiguous());
    }

    #[test]
    fn test_unreadable_submission_is_unverified() {
        let err = BrokerError::Parse("expected value at line 1".into()).after_submission();
        assert_eq!(err.class(), ErrorClass::Unverified);
        assert!(err.is_ambiguous());
        assert_eq!(
            err.to_string(),
            "Order submission unverified: unreadable response: expected value at line 1"
        );
        let rejected = BrokerError::InsufficientFunds("".into()).after_submission();
        assert_eq!(rejected.class(), ErrorClass::Permanent);
    }
}
