//! Per-account status published by each supervisor

use chrono::{DateTime, Utc};
use meridian_core::{AccountId, Percent, PositionSide, Price, Quantity, Symbol};
use meridian_order_manager::PositionState;
use meridian_risk_manager::RiskSnapshot;
use rust_decimal::Decimal;
use serde::Serialize;

/// Health of one account task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskHealth {
    Healthy,
    Degraded {
        reason: String,
        consecutive_failures: u32,
    },
}

impl TaskHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, TaskHealth::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionStatus {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: Price,
    pub remaining_qty: Quantity,
    pub mark_price: Option<Price>,
    /// Net of the round-trip fee at the mark price
    pub net_pnl_pct: Option<Percent>,
    pub state: PositionState,
    pub exit_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatus {
    pub account: AccountId,
    pub cash: Decimal,
    pub equity: Decimal,
    /// Balance is a cached reading after a failed refresh
    pub balance_stale: bool,
    pub positions: Vec<PositionStatus>,
    pub pending_orders: usize,
    pub risk: RiskSnapshot,
    pub health: TaskHealth,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Most specific reason the latest attempted trade did not execute
    pub last_skip: Option<String>,
}
