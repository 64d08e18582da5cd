//! Drawdown tracking and the size throttle it drives

use log::{info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::parameters::DrawdownLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThrottleLevel {
    Unrestricted,
    Reduced,
    Minimal,
    /// New entries vetoed
    Halted,
}

impl ThrottleLevel {
    pub fn from_drawdown(drawdown_pct: Decimal, limits: &DrawdownLimits) -> Self {
        if drawdown_pct >= limits.halt_at_pct {
            ThrottleLevel::Halted
        } else if drawdown_pct >= limits.minimal_at_pct {
            ThrottleLevel::Minimal
        } else if drawdown_pct >= limits.reduced_at_pct {
            ThrottleLevel::Reduced
        } else {
            ThrottleLevel::Unrestricted
        }
    }

    pub fn size_multiplier(&self) -> Decimal {
        match self {
            ThrottleLevel::Unrestricted => Decimal::ONE,
            ThrottleLevel::Reduced => dec!(0.5),
            ThrottleLevel::Minimal => dec!(0.25),
            ThrottleLevel::Halted => Decimal::ZERO,
        }
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleLevel::Unrestricted => f.write_str("UNRESTRICTED"),
            ThrottleLevel::Reduced => f.write_str("REDUCED"),
            ThrottleLevel::Minimal => f.write_str("MINIMAL"),
            ThrottleLevel::Halted => f.write_str("HALTED"),
        }
    }
}

/// Peak-to-trough equity drawdown
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    limits: DrawdownLimits,
    peak: Decimal,
    current: Decimal,
    max_drawdown_pct: Decimal,
    level: ThrottleLevel,
}

impl DrawdownTracker {
    pub fn new(limits: DrawdownLimits) -> Self {
        Self {
            limits,
            peak: Decimal::ZERO,
            current: Decimal::ZERO,
            max_drawdown_pct: Decimal::ZERO,
            level: ThrottleLevel::Unrestricted,
        }
    }

    /// Record the latest equity and return the resulting throttle level
    pub fn update(&mut self, equity: Decimal) -> ThrottleLevel {
        self.current = equity;
        if equity > self.peak {
            self.peak = equity;
        }
        let drawdown = self.drawdown_pct();
        if drawdown > self.max_drawdown_pct {
            self.max_drawdown_pct = drawdown;
        }

        let level = ThrottleLevel::from_drawdown(drawdown, &self.limits);
        if level != self.level {
            if level > self.level {
                warn!(
                    "[RISK] Drawdown {:.2}% from peak {}: throttle {} -> {}",
                    drawdown, self.peak, self.level, level
                );
            } else {
                info!("[RISK] Drawdown recovered to {:.2}%: throttle {} -> {}", drawdown, self.level, level);
            }
            self.level = level;
        }
        level
    }

    pub fn drawdown_pct(&self) -> Decimal {
        if self.peak <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak - self.current) / self.peak * Decimal::ONE_HUNDRED).max(Decimal::ZERO)
    }

    pub fn max_drawdown_pct(&self) -> Decimal {
        self.max_drawdown_pct
    }

    pub fn peak(&self) -> Decimal {
        self.peak
    }

    pub fn level(&self) -> ThrottleLevel {
        self.level
    }
}
