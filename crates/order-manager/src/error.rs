//! Order Manager errors

use meridian_core::{PositionSide, Symbol};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid exit rules: {0}")]
    InvalidRules(String),

    #[error("No open position {id} on {symbol}")]
    UnknownPosition { symbol: Symbol, id: Uuid },

    #[error("{symbol} already has an open {existing} position")]
    OppositePosition {
        symbol: Symbol,
        existing: PositionSide,
    },

    #[error("Invalid fill: {0}")]
    InvalidFill(String),
}

pub type Result<T> = std::result::Result<T, Error>;
