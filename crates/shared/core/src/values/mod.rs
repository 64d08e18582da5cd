use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Price value - uses Decimal for precision
pub type Price = Decimal;

/// Quantity value in base units
pub type Quantity = Decimal;

/// Percentage value where `1.4` means 1.4 %
pub type Percent = Decimal;

/// Timestamp in UTC
pub type Timestamp = DateTime<Utc>;
