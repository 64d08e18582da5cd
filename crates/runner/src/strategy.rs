//! Strategy port
//!
//! Signal generation lives outside this crate. A strategy sees one symbol's
//! candles and the account's exposure and answers enter or hold; sizing and
//! vetoes belong to the risk governor, exits to the exit engine.

use meridian_core::{AccountId, Candle, Percent, PositionSide, Symbol};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    EnterLong,
    EnterShort,
    Hold,
}

impl Signal {
    pub fn side(&self) -> Option<PositionSide> {
        match self {
            Signal::EnterLong => Some(PositionSide::Long),
            Signal::EnterShort => Some(PositionSide::Short),
            Signal::Hold => None,
        }
    }
}

/// What a strategy is shown for one symbol
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput<'a> {
    pub account: &'a AccountId,
    pub symbol: &'a Symbol,
    /// Oldest first
    pub candles: &'a [Candle],
    pub open_positions: usize,
    pub cash: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyDecision {
    pub signal: Signal,
    /// Share of equity the strategy wants to commit, in percent
    pub size_pct: Percent,
    /// Setup quality, 0..1
    pub quality: Decimal,
}

impl StrategyDecision {
    pub fn hold() -> Self {
        Self {
            signal: Signal::Hold,
            size_pct: Decimal::ZERO,
            quality: Decimal::ZERO,
        }
    }
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, input: &StrategyInput<'_>) -> StrategyDecision;
}

/// Never enters. Accounts run purely to manage the positions they hold.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitOnlyStrategy;

impl Strategy for ExitOnlyStrategy {
    fn name(&self) -> &str {
        "exit-only"
    }

    fn evaluate(&self, _input: &StrategyInput<'_>) -> StrategyDecision {
        StrategyDecision::hold()
    }
}
