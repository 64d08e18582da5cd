//! Rolling window of closed-trade outcomes

use meridian_core::Percent;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;

/// Profit factor reported when the window holds gains but no losses
pub const UNBOUNDED_PROFIT_FACTOR: Decimal = Decimal::from_parts(999, 0, 0, false, 0);

/// Summary used against the tier performance bars
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub samples: usize,
    pub win_rate: Decimal,
    pub profit_factor: Decimal,
    /// Largest peak-to-trough equity drawdown observed
    pub max_drawdown_pct: Decimal,
}

#[derive(Debug, Clone)]
pub struct OutcomeWindow {
    capacity: usize,
    meaningful_win_pct: Percent,
    net_pnl: VecDeque<Percent>,
    total_recorded: u64,
}

impl OutcomeWindow {
    pub fn new(capacity: usize, meaningful_win_pct: Percent) -> Self {
        Self {
            capacity: capacity.max(1),
            meaningful_win_pct,
            net_pnl: VecDeque::with_capacity(capacity),
            total_recorded: 0,
        }
    }

    pub fn push(&mut self, net_pnl_pct: Percent) {
        if self.net_pnl.len() == self.capacity {
            self.net_pnl.pop_front();
        }
        self.net_pnl.push_back(net_pnl_pct);
        self.total_recorded += 1;
    }

    pub fn len(&self) -> usize {
        self.net_pnl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.net_pnl.is_empty()
    }

    /// Outcomes ever recorded, including those rolled out of the window
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn values(&self) -> Vec<Percent> {
        self.net_pnl.iter().copied().collect()
    }

    /// Share of trades whose net P&L beat the meaningful-win threshold
    ///
    /// A scratch trade that merely covers fees is not a win.
    pub fn win_rate(&self) -> Decimal {
        if self.net_pnl.is_empty() {
            return Decimal::ZERO;
        }
        let wins = self
            .net_pnl
            .iter()
            .filter(|p| **p > self.meaningful_win_pct)
            .count();
        Decimal::from(wins) / Decimal::from(self.net_pnl.len())
    }

    /// Gross gains over gross losses
    pub fn profit_factor(&self) -> Decimal {
        let gains: Decimal = self.net_pnl.iter().filter(|p| p.is_sign_positive()).sum();
        let losses: Decimal = self
            .net_pnl
            .iter()
            .filter(|p| p.is_sign_negative())
            .map(|p| p.abs())
            .sum();
        if losses.is_zero() {
            if gains.is_zero() {
                Decimal::ZERO
            } else {
                UNBOUNDED_PROFIT_FACTOR
            }
        } else {
            gains / losses
        }
    }

    pub fn stats(&self, max_drawdown_pct: Decimal) -> PerformanceStats {
        PerformanceStats {
            samples: self.len(),
            win_rate: self.win_rate(),
            profit_factor: self.profit_factor(),
            max_drawdown_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_scratch_trades_are_not_wins() {
        let mut window = OutcomeWindow::new(10, dec!(0.25));
        window.push(dec!(0.1));
        window.push(dec!(0.25));
        window.push(dec!(0.8));
        window.push(dec!(-1.0));
        assert_eq!(window.win_rate(), dec!(0.25));
    }

    #[test]
    fn test_window_rolls() {
        let mut window = OutcomeWindow::new(3, dec!(0.25));
        for pnl in [dec!(-1), dec!(1), dec!(1), dec!(1)] {
            window.push(pnl);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.total_recorded(), 4);
        assert_eq!(window.win_rate(), dec!(1));
    }

    #[test]
    fn test_profit_factor() {
        let mut window = OutcomeWindow::new(10, dec!(0.25));
        assert_eq!(window.profit_factor(), dec!(0));
        window.push(dec!(2));
        assert_eq!(window.profit_factor(), UNBOUNDED_PROFIT_FACTOR);
        window.push(dec!(-1));
        window.push(dec!(1));
        assert_eq!(window.profit_factor(), dec!(3));
    }
}
