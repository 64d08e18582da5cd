use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{OrderStatus, OrderType, Side};
use crate::market::Symbol;
use crate::values::{Price, Quantity};

/// How much to trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSize {
    /// Notional amount in quote currency (entries are sized this way)
    Quote(Decimal),
    /// Quantity in base units (exits are sized this way)
    Base(Quantity),
}

impl OrderSize {
    /// Quote-currency notional at the given reference price
    pub fn notional(&self, price: Price) -> Decimal {
        match self {
            OrderSize::Quote(amount) => *amount,
            OrderSize::Base(qty) => *qty * price,
        }
    }

    pub fn is_positive(&self) -> bool {
        match self {
            OrderSize::Quote(v) | OrderSize::Base(v) => *v > Decimal::ZERO,
        }
    }
}

/// Order submission request
///
/// Immutable once built. The client order id is assigned here, once, and
/// reused by every retry so the exchange can deduplicate resubmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub size: OrderSize,
    pub order_type: OrderType,
    /// Required for limit orders
    pub limit_price: Option<Price>,
}

impl OrderRequest {
    /// Create a market order request
    pub fn market(symbol: Symbol, side: Side, size: OrderSize) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            symbol,
            side,
            size,
            order_type: OrderType::Market,
            limit_price: None,
        }
    }

    /// Create a limit order request
    pub fn limit(symbol: Symbol, side: Side, size: OrderSize, price: Price) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            symbol,
            side,
            size,
            order_type: OrderType::Limit,
            limit_price: Some(price),
        }
    }

    /// Validate the order based on order type requirements
    pub fn is_well_formed(&self) -> bool {
        let priced = match self.order_type {
            OrderType::Market => true,
            OrderType::Limit => self.limit_price.is_some_and(|p| p > Decimal::ZERO),
        };
        priced && self.size.is_positive()
    }
}

/// Identifies an order on an exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle {
    /// Exchange-assigned order id
    pub order_id: String,
    pub client_order_id: Uuid,
    /// Some exchanges need the symbol to query or cancel an order
    pub symbol: Symbol,
}

/// What the exchange says about an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub handle: OrderHandle,
    pub side: Side,
    pub status: OrderStatus,
    /// Cumulative filled quantity in base units
    pub filled_qty: Quantity,
    /// Average fill price (if any fills)
    pub avg_price: Option<Price>,
    /// Fees charged so far, in quote currency
    pub fee: Decimal,
}

impl ExecutionReport {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn has_fills(&self) -> bool {
        self.filled_qty > Decimal::ZERO && self.avg_price.is_some()
    }
}
