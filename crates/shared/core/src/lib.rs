//! Meridian Core Domain
//!
//! Pure domain types shared by every Meridian component.
//! This crate contains no async, no I/O, and is 100% unit testable.

pub mod entities;
pub mod identity;
pub mod market;
pub mod values;

// Re-export commonly used types at crate root
pub use entities::{
    ExecutionReport, ExitReason, OrderHandle, OrderRequest, OrderSize, OrderStatus, OrderType,
    PositionSide, Side, TradeResult,
};
pub use identity::{AccountId, AccountRole, ExchangeId, ParseIdentityError};
pub use market::{Candle, ParseSymbolError, Symbol, Timeframe};
pub use values::{Percent, Price, Quantity, Timestamp};
