//! Market Surveillance
//!
//! Reads a candle window and answers one question: is this market worth
//! entering right now, and how hard?
//!
//! - **Volatility**: ATR (Wilder smoothing) as a percentage of the last close
//! - **Trend strength**: Kaufman efficiency ratio, 0 (chop) to 1 (straight line)
//! - **Volume percentile**: where the last bar's volume ranks in the window

use meridian_core::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::parameters::ModeThresholds;

/// Entry posture for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    /// Full-size entries
    Aggressive,
    /// Highest-quality setups only, at a fraction of normal size
    Cautious,
    /// No new entries; exits still run
    Idle,
}

impl TradingMode {
    pub fn size_multiplier(&self, thresholds: &ModeThresholds) -> Decimal {
        match self {
            TradingMode::Aggressive => Decimal::ONE,
            TradingMode::Cautious => thresholds.cautious_size_multiplier,
            TradingMode::Idle => Decimal::ZERO,
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Aggressive => f.write_str("AGGRESSIVE"),
            TradingMode::Cautious => f.write_str("CAUTIOUS"),
            TradingMode::Idle => f.write_str("IDLE"),
        }
    }
}

/// Market measures derived from one candle window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    pub volatility_pct: Decimal,
    pub trend_strength: Decimal,
    pub volume_percentile: Decimal,
}

impl MarketConditions {
    /// Needs at least `atr_period + 1` candles, oldest first
    pub fn from_candles(candles: &[Candle], atr_period: usize) -> Option<Self> {
        if atr_period == 0 || candles.len() < atr_period + 1 {
            return None;
        }
        let last = candles.last()?;
        if last.close <= Decimal::ZERO {
            return None;
        }

        let atr = wilder_atr(candles, atr_period)?;
        Some(Self {
            volatility_pct: atr / last.close * Decimal::ONE_HUNDRED,
            trend_strength: efficiency_ratio(candles),
            volume_percentile: volume_percentile(candles),
        })
    }
}

/// ATR over the whole window: simple mean of the first `period` true ranges,
/// then Wilder smoothing for the rest
fn wilder_atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    let ranges: Vec<Decimal> = candles
        .windows(2)
        .map(|pair| pair[1].true_range(Some(pair[0].close)))
        .collect();
    if ranges.len() < period {
        return None;
    }

    let n = Decimal::from(period);
    let seed: Decimal = ranges[..period].iter().sum::<Decimal>() / n;
    Some(
        ranges[period..]
            .iter()
            .fold(seed, |atr, tr| (atr * (n - Decimal::ONE) + tr) / n),
    )
}

/// |net change| / sum of |bar-to-bar changes|
fn efficiency_ratio(candles: &[Candle]) -> Decimal {
    let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
        return Decimal::ZERO;
    };
    let path: Decimal = candles
        .windows(2)
        .map(|pair| (pair[1].close - pair[0].close).abs())
        .sum();
    if path.is_zero() {
        return Decimal::ZERO;
    }
    (last.close - first.close).abs() / path
}

/// Share of bars whose volume is at or below the last bar's, as 0..100
fn volume_percentile(candles: &[Candle]) -> Decimal {
    let Some(last) = candles.last() else {
        return Decimal::ZERO;
    };
    let at_or_below = candles.iter().filter(|c| c.volume <= last.volume).count();
    Decimal::from(at_or_below) * Decimal::ONE_HUNDRED / Decimal::from(candles.len())
}

/// Pick the entry posture and say why
///
/// `win_rate` is `None` until the outcome window holds enough samples; until
/// then the win-rate bar does not block AGGRESSIVE.
pub fn select_mode(
    conditions: Option<&MarketConditions>,
    win_rate: Option<Decimal>,
    thresholds: &ModeThresholds,
) -> (TradingMode, String) {
    let Some(c) = conditions else {
        return (TradingMode::Idle, "insufficient market data".to_string());
    };

    if c.volatility_pct < thresholds.min_volatility_pct {
        return (
            TradingMode::Idle,
            format!(
                "volatility {:.2}% below {}%",
                c.volatility_pct, thresholds.min_volatility_pct
            ),
        );
    }
    if c.volatility_pct > thresholds.max_volatility_pct {
        return (
            TradingMode::Idle,
            format!(
                "volatility {:.2}% above {}%",
                c.volatility_pct, thresholds.max_volatility_pct
            ),
        );
    }
    if c.volume_percentile < thresholds.min_volume_percentile {
        return (
            TradingMode::Idle,
            format!(
                "volume percentile {:.0} below {}",
                c.volume_percentile, thresholds.min_volume_percentile
            ),
        );
    }

    if c.trend_strength < thresholds.aggressive_trend {
        return (
            TradingMode::Cautious,
            format!(
                "trend strength {:.2} below {}",
                c.trend_strength, thresholds.aggressive_trend
            ),
        );
    }
    match win_rate {
        Some(rate) if rate < thresholds.aggressive_win_rate => (
            TradingMode::Cautious,
            format!(
                "win rate {:.2} below {}",
                rate, thresholds.aggressive_win_rate
            ),
        ),
        _ => (
            TradingMode::Aggressive,
            format!("trend strength {:.2}", c.trend_strength),
        ),
    }
}
