//! Risk Governor Parameters
//!
//! Every threshold the governor applies, loaded from configuration. `_pct`
//! values are percentages; win rates and ratios are fractions.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RiskError};
use crate::tiers::CapitalTier;

/// Market readiness thresholds for mode selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    /// Candles used for the ATR
    pub atr_period: usize,
    pub min_volatility_pct: Decimal,
    pub max_volatility_pct: Decimal,
    /// Volume percentile below which the market is considered dead
    pub min_volume_percentile: Decimal,
    /// Efficiency ratio at or above which a trend is strong
    pub aggressive_trend: Decimal,
    /// Meaningful-win rate required for AGGRESSIVE once enough samples exist
    pub aggressive_win_rate: Decimal,
    /// Minimum setup quality accepted in CAUTIOUS mode
    pub cautious_min_quality: Decimal,
    /// Size multiplier applied in CAUTIOUS mode
    pub cautious_size_multiplier: Decimal,
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self {
            atr_period: 14,
            min_volatility_pct: dec!(0.15),
            max_volatility_pct: dec!(5.0),
            min_volume_percentile: dec!(20),
            aggressive_trend: dec!(0.35),
            aggressive_win_rate: dec!(0.55),
            cautious_min_quality: dec!(0.7),
            cautious_size_multiplier: dec!(0.25),
        }
    }
}

/// Rolling trade-outcome window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeLimits {
    pub window: usize,
    /// Samples needed before the win rate influences anything
    pub min_samples: usize,
    /// Net P&L a trade must exceed to count as a win
    pub meaningful_win_pct: Decimal,
}

impl Default for OutcomeLimits {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 10,
            meaningful_win_pct: dec!(0.25),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerLimits {
    pub max_consecutive_losses: u32,
    pub cooldown_minutes: u64,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        Self {
            max_consecutive_losses: 3,
            cooldown_minutes: 60,
        }
    }
}

/// Drawdown from peak equity at which the throttle steps down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawdownLimits {
    pub reduced_at_pct: Decimal,
    pub minimal_at_pct: Decimal,
    pub halt_at_pct: Decimal,
}

impl Default for DrawdownLimits {
    fn default() -> Self {
        Self {
            reduced_at_pct: dec!(5),
            minimal_at_pct: dec!(10),
            halt_at_pct: dec!(15),
        }
    }
}

/// Monte Carlo stress test run before unlocking a tier that requires it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressLimits {
    pub simulations: usize,
    /// Trades simulated after the shock
    pub horizon_trades: usize,
    /// Immediate equity drawdown injected at the start of every path
    pub shock_pct: Decimal,
    /// Drawdown from the starting equity counted as ruin
    pub ruin_drawdown_pct: Decimal,
    pub max_ruin_probability: Decimal,
    pub seed: u64,
}

impl Default for StressLimits {
    fn default() -> Self {
        Self {
            simulations: 500,
            horizon_trades: 50,
            shock_pct: dec!(20),
            ruin_drawdown_pct: dec!(50),
            max_ruin_probability: dec!(0.05),
            seed: 42,
        }
    }
}

/// Complete governor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub mode: ModeThresholds,
    pub outcomes: OutcomeLimits,
    pub breaker: BreakerLimits,
    pub drawdown: DrawdownLimits,
    pub stress: StressLimits,
    /// Ascending by `min_balance`; the first tier must start at zero
    pub tiers: Vec<CapitalTier>,
    /// Share of equity always kept as cash
    pub reserve_ratio: Decimal,
    pub max_open_positions: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            mode: ModeThresholds::default(),
            outcomes: OutcomeLimits::default(),
            breaker: BreakerLimits::default(),
            drawdown: DrawdownLimits::default(),
            stress: StressLimits::default(),
            tiers: CapitalTier::default_table(),
            reserve_ratio: dec!(0.1),
            max_open_positions: 3,
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> Result<()> {
        let first = self
            .tiers
            .first()
            .ok_or_else(|| RiskError::InvalidConfig("at least one capital tier is required".into()))?;
        if !first.min_balance.is_zero() {
            return Err(RiskError::InvalidConfig(format!(
                "first tier '{}' must start at a zero balance",
                first.name
            )));
        }
        for pair in self.tiers.windows(2) {
            if pair[1].min_balance <= pair[0].min_balance {
                return Err(RiskError::InvalidConfig(format!(
                    "tier '{}' must start above tier '{}'",
                    pair[1].name, pair[0].name
                )));
            }
        }
        if let Some(tier) = self
            .tiers
            .iter()
            .find(|t| t.max_trade_pct <= Decimal::ZERO || t.max_trade_pct > Decimal::ONE_HUNDRED)
        {
            return Err(RiskError::InvalidConfig(format!(
                "tier '{}' max_trade_pct {} outside (0, 100]",
                tier.name, tier.max_trade_pct
            )));
        }

        let d = &self.drawdown;
        if !(d.reduced_at_pct < d.minimal_at_pct && d.minimal_at_pct < d.halt_at_pct) {
            return Err(RiskError::InvalidConfig(
                "drawdown levels must satisfy reduced < minimal < halt".into(),
            ));
        }
        if self.mode.min_volatility_pct >= self.mode.max_volatility_pct {
            return Err(RiskError::InvalidConfig(
                "min_volatility_pct must be below max_volatility_pct".into(),
            ));
        }
        if self.mode.atr_period == 0 || self.outcomes.window == 0 {
            return Err(RiskError::InvalidConfig(
                "atr_period and outcome window must be positive".into(),
            ));
        }
        if self.reserve_ratio < Decimal::ZERO || self.reserve_ratio >= Decimal::ONE {
            return Err(RiskError::InvalidConfig(format!(
                "reserve_ratio {} outside [0, 1)",
                self.reserve_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GovernorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tiers_must_ascend() {
        let mut config = GovernorConfig::default();
        config.tiers.swap(1, 2);
        assert!(matches!(config.validate(), Err(RiskError::InvalidConfig(_))));
    }

    #[test]
    fn test_drawdown_levels_must_order() {
        let config = GovernorConfig {
            drawdown: DrawdownLimits {
                reduced_at_pct: dec!(10),
                minimal_at_pct: dec!(5),
                halt_at_pct: dec!(15),
            },
            ..GovernorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
