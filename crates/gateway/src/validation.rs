//! Pre-flight order validation
//!
//! Runs before any network call. Every failure here is permanent.

use meridian_core::{ExchangeId, OrderRequest, Price};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Per-exchange trading rules used to reject orders locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRules {
    pub exchange: ExchangeId,
    /// Smallest order notional the exchange accepts, in quote currency
    pub min_order_notional: Decimal,
    /// Quote currencies this deployment trades against on the exchange
    pub supported_quotes: Vec<String>,
    /// Whether short entries are allowed (spot accounts cannot short)
    pub allow_short: bool,
}

impl ExchangeRules {
    pub fn new(exchange: ExchangeId, min_order_notional: Decimal) -> Self {
        Self {
            exchange,
            min_order_notional,
            supported_quotes: vec!["USD".to_string(), "USDT".to_string(), "USDC".to_string()],
            allow_short: false,
        }
    }

    pub fn with_quotes(mut self, quotes: &[&str]) -> Self {
        self.supported_quotes = quotes.iter().map(|q| q.to_ascii_uppercase()).collect();
        self
    }

    pub fn supports_quote(&self, quote: &str) -> bool {
        self.supported_quotes
            .iter()
            .any(|q| q.eq_ignore_ascii_case(quote))
    }

    /// Validate an order at `reference_price` (used to value base-sized orders)
    pub fn validate(&self, request: &OrderRequest, reference_price: Price) -> BrokerResult<()> {
        if !request.is_well_formed() {
            return Err(BrokerError::InvalidRequest(format!(
                "malformed {:?} order for {}",
                request.order_type, request.symbol
            )));
        }
        if !self.supports_quote(request.symbol.quote()) {
            return Err(BrokerError::UnsupportedPair {
                symbol: request.symbol.clone(),
                exchange: self.exchange,
            });
        }
        if reference_price <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(format!(
                "no reference price for {}",
                request.symbol
            )));
        }

        let notional = request.size.notional(reference_price).round_dp(2);
        if notional < self.min_order_notional {
            return Err(BrokerError::BelowMinimum {
                notional,
                minimum: self.min_order_notional,
            });
        }
        Ok(())
    }
}
