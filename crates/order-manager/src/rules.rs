//! Exit rule configuration
//!
//! All `_pct` values are percentages (`1.4` means 1.4 %).

use meridian_core::Percent;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One step of the profit ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitRung {
    /// Net P&L at or above which the rung fires
    pub net_pct: Percent,
    /// Share of the *remaining* size to exit
    pub exit_pct: Percent,
}

impl ProfitRung {
    pub fn new(net_pct: Percent, exit_pct: Percent) -> Self {
        Self { net_pct, exit_pct }
    }
}

/// Trailing stop that locks in part of the best move
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingRule {
    /// Net P&L at which the stop is first armed
    pub activation_net_pct: Percent,
    /// Fraction of the entry-to-best move the stop retains (0..=1)
    pub retention: Decimal,
}

impl Default for TrailingRule {
    fn default() -> Self {
        Self {
            activation_net_pct: dec!(1.5),
            retention: dec!(0.5),
        }
    }
}

/// Per-exchange exit discipline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitRules {
    /// Combined cost of opening and closing a position
    pub round_trip_fee_pct: Percent,
    /// Ascending by `net_pct`
    pub profit_ladder: Vec<ProfitRung>,
    pub trailing: Option<TrailingRule>,
    /// Largest adverse gross move tolerated before a full exit
    pub stop_loss_pct: Percent,
    pub max_hold_minutes: u64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            round_trip_fee_pct: dec!(0.52),
            profit_ladder: vec![
                ProfitRung::new(dec!(0.5), dec!(25)),
                ProfitRung::new(dec!(1.0), dec!(25)),
                ProfitRung::new(dec!(2.0), dec!(50)),
            ],
            trailing: Some(TrailingRule::default()),
            stop_loss_pct: dec!(1.0),
            max_hold_minutes: 240,
        }
    }
}

impl ExitRules {
    pub fn max_hold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_hold_minutes.min(i64::MAX as u64) as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.round_trip_fee_pct < Decimal::ZERO {
            return Err(Error::InvalidRules("round_trip_fee_pct is negative".into()));
        }
        if self.stop_loss_pct <= Decimal::ZERO {
            return Err(Error::InvalidRules("stop_loss_pct must be positive".into()));
        }
        if self.max_hold_minutes == 0 {
            return Err(Error::InvalidRules("max_hold_minutes must be positive".into()));
        }
        for (i, rung) in self.profit_ladder.iter().enumerate() {
            if rung.exit_pct <= Decimal::ZERO || rung.exit_pct > Decimal::ONE_HUNDRED {
                return Err(Error::InvalidRules(format!(
                    "rung #{} exit_pct {} outside (0, 100]",
                    i + 1,
                    rung.exit_pct
                )));
            }
            if i > 0 && rung.net_pct <= self.profit_ladder[i - 1].net_pct {
                return Err(Error::InvalidRules(format!(
                    "profit ladder not ascending at rung #{}",
                    i + 1
                )));
            }
        }
        if let Some(trailing) = &self.trailing {
            if trailing.retention <= Decimal::ZERO || trailing.retention > Decimal::ONE {
                return Err(Error::InvalidRules(format!(
                    "trailing retention {} outside (0, 1]",
                    trailing.retention
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ExitRules::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_unsorted_ladder() {
        let rules = ExitRules {
            profit_ladder: vec![
                ProfitRung::new(dec!(1.0), dec!(25)),
                ProfitRung::new(dec!(0.5), dec!(25)),
            ],
            ..ExitRules::default()
        };
        let err = rules.validate().unwrap_err();
        assert!(err.to_string().contains("rung #2"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let rules: ExitRules =
            serde_json::from_str(r#"{ "round_trip_fee_pct": "1.4", "trailing": null }"#).unwrap();
        assert_eq!(rules.round_trip_fee_pct, dec!(1.4));
        assert!(rules.trailing.is_none());
        assert_eq!(rules.profit_ladder.len(), 3);
        assert_eq!(rules.max_hold(), chrono::Duration::hours(4));
    }
}
