use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Where an order stands on the venue, normalized across exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Status of an order the venue still reports as working
    pub fn working(filled_qty: Decimal) -> Self {
        if filled_qty > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        }
    }

    /// The venue will not change this order any more
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_working_status_follows_fills() {
        assert_eq!(OrderStatus::working(dec!(0)), OrderStatus::Open);
        assert_eq!(OrderStatus::working(dec!(0.4)), OrderStatus::PartiallyFilled);
        assert!(OrderStatus::working(dec!(0.4)).is_active());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
    }
}
