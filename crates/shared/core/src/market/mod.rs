mod candle;
mod symbol;

pub use candle::{Candle, Timeframe};
pub use symbol::Symbol;

use thiserror::Error;

/// Failure to parse a canonical `BASE-QUOTE` symbol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid symbol (expected BASE-QUOTE): {0}")]
pub struct ParseSymbolError(pub String);
