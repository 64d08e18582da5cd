use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::PositionSide;
use crate::identity::AccountId;
use crate::market::Symbol;
use crate::values::Percent;

/// Why a position (or part of it) was exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// A rung of the stepped profit ladder fired (index into the ladder)
    ProfitTarget { rung: usize },
    TrailingStop,
    StopLoss,
    MaxHold,
    /// The exchange no longer holds the asset (closed outside this process)
    External,
}

impl ExitReason {
    pub fn is_full_exit(&self) -> bool {
        !matches!(self, ExitReason::ProfitTarget { .. })
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::ProfitTarget { rung } => write!(f, "profit target #{}", rung + 1),
            ExitReason::TrailingStop => f.write_str("trailing stop"),
            ExitReason::StopLoss => f.write_str("stop loss"),
            ExitReason::MaxHold => f.write_str("max hold"),
            ExitReason::External => f.write_str("closed externally"),
        }
    }
}

/// One closed position, as published on the trade-result feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub account: AccountId,
    pub symbol: Symbol,
    pub side: PositionSide,
    /// Size-weighted net P&L over every exit of the position
    pub net_pnl_pct: Percent,
    /// Reason for the final exit
    pub exit_reason: ExitReason,
    /// Number of partial exits before the final one
    pub partial_exits: u32,
    pub closed_at: DateTime<Utc>,
}

impl TradeResult {
    pub fn is_loss(&self) -> bool {
        self.net_pnl_pct.is_sign_negative() && !self.net_pnl_pct.is_zero()
    }
}
