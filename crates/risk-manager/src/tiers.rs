//! Capital tiers
//!
//! Balance decides which tier an account *could* use; performance decides
//! which tier it has *unlocked*. The effective tier is the lower of the two.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::outcomes::PerformanceStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalTier {
    pub name: String,
    /// Smallest equity at which the tier applies
    pub min_balance: Decimal,
    /// Largest single trade as a percentage of equity
    pub max_trade_pct: Decimal,
    /// Performance bar an account must meet to unlock the tier
    pub min_win_rate: Decimal,
    pub min_profit_factor: Decimal,
    pub max_drawdown_pct: Decimal,
    /// Whether unlocking also requires a passing stress simulation
    #[serde(default)]
    pub requires_stress_test: bool,
}

impl CapitalTier {
    fn new(
        name: &str,
        min_balance: Decimal,
        max_trade_pct: Decimal,
        min_win_rate: Decimal,
        min_profit_factor: Decimal,
        max_drawdown_pct: Decimal,
        requires_stress_test: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            min_balance,
            max_trade_pct,
            min_win_rate,
            min_profit_factor,
            max_drawdown_pct,
            requires_stress_test,
        }
    }

    pub fn default_table() -> Vec<CapitalTier> {
        vec![
            CapitalTier::new("seed", dec!(0), dec!(5), dec!(0), dec!(0), dec!(100), false),
            CapitalTier::new("growth", dec!(1000), dec!(10), dec!(0.45), dec!(1.1), dec!(15), false),
            CapitalTier::new("scale", dec!(5000), dec!(15), dec!(0.5), dec!(1.3), dec!(12), true),
            CapitalTier::new("full", dec!(25000), dec!(20), dec!(0.55), dec!(1.5), dec!(10), true),
        ]
    }

    /// Whether `stats` clear this tier's performance bar
    pub fn performance_met(&self, stats: &PerformanceStats) -> bool {
        stats.win_rate >= self.min_win_rate
            && stats.profit_factor >= self.min_profit_factor
            && stats.max_drawdown_pct <= self.max_drawdown_pct
    }
}

/// Index of the highest tier whose balance floor `equity` reaches
pub fn tier_for_balance(tiers: &[CapitalTier], equity: Decimal) -> usize {
    tiers
        .iter()
        .rposition(|t| equity >= t.min_balance)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(win_rate: Decimal, profit_factor: Decimal, dd: Decimal) -> PerformanceStats {
        PerformanceStats {
            samples: 20,
            win_rate,
            profit_factor,
            max_drawdown_pct: dd,
        }
    }

    #[test]
    fn test_tier_for_balance() {
        let tiers = CapitalTier::default_table();
        assert_eq!(tier_for_balance(&tiers, dec!(50)), 0);
        assert_eq!(tier_for_balance(&tiers, dec!(1000)), 1);
        assert_eq!(tier_for_balance(&tiers, dec!(4999.99)), 1);
        assert_eq!(tier_for_balance(&tiers, dec!(100000)), 3);
    }

    #[test]
    fn test_performance_bar() {
        let growth = &CapitalTier::default_table()[1];
        assert!(growth.performance_met(&stats(dec!(0.5), dec!(1.2), dec!(8))));
        assert!(!growth.performance_met(&stats(dec!(0.4), dec!(1.2), dec!(8))));
        assert!(!growth.performance_met(&stats(dec!(0.5), dec!(1.0), dec!(8))));
        assert!(!growth.performance_met(&stats(dec!(0.5), dec!(1.2), dec!(20))));
    }
}
