//! Open positions
//!
//! A position is created by a confirmed entry fill, shrinks with every exit
//! and disappears when nothing remains. Entries on the same symbol and side
//! average into it.

use chrono::{DateTime, Utc};
use meridian_core::{Percent, PositionSide, Price, Quantity, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Lifecycle state of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    PartialExit,
    Closed,
}

/// One open position of an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: Symbol,
    pub side: PositionSide,
    /// Size-weighted average entry price
    pub entry_price: Price,
    /// Total size ever entered, in base units
    pub original_qty: Quantity,
    pub remaining_qty: Quantity,
    pub opened_at: DateTime<Utc>,
    /// Highest price seen for longs, lowest for shorts. Only advances.
    pub best_price: Price,
    /// Ladder rungs already fired or consumed
    pub fired_rungs: BTreeSet<usize>,
    /// Armed trailing stop price. Only tightens.
    pub trailing_stop: Option<Price>,
    pub state: PositionState,
    /// An exit order is outstanding and unconfirmed
    pub exit_pending: bool,
    pub partial_exits: u32,
    /// Sum of `qty * net_pct` over every exit so far
    realized_weighted_pct: Decimal,
    exited_qty: Quantity,
}

impl Position {
    pub fn open(
        symbol: Symbol,
        side: PositionSide,
        price: Price,
        qty: Quantity,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            side,
            entry_price: price,
            original_qty: qty,
            remaining_qty: qty,
            opened_at,
            best_price: price,
            fired_rungs: BTreeSet::new(),
            trailing_stop: None,
            state: PositionState::Open,
            exit_pending: false,
            partial_exits: 0,
            realized_weighted_pct: Decimal::ZERO,
            exited_qty: Decimal::ZERO,
        }
    }

    fn sign(&self) -> Decimal {
        Decimal::from(self.side.sign())
    }

    /// Price move in the position's favour, as a percentage of entry
    pub fn gross_pnl_pct(&self, price: Price) -> Percent {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED * self.sign()
    }

    /// Gross P&L less the round-trip fee
    pub fn net_pnl_pct(&self, price: Price, round_trip_fee_pct: Percent) -> Percent {
        self.gross_pnl_pct(price) - round_trip_fee_pct
    }

    /// Share of the original size still open, 0..=1
    pub fn remaining_fraction(&self) -> Decimal {
        if self.original_qty.is_zero() {
            return Decimal::ZERO;
        }
        self.remaining_qty / self.original_qty
    }

    pub fn notional(&self, price: Price) -> Decimal {
        self.remaining_qty * price
    }

    /// Whether `price` beats the best price seen so far
    pub fn is_new_best(&self, price: Price) -> bool {
        match self.side {
            PositionSide::Long => price > self.best_price,
            PositionSide::Short => price < self.best_price,
        }
    }

    /// Whether `price` has crossed the armed trailing stop
    pub fn trailing_stop_hit(&self, price: Price) -> bool {
        match (self.trailing_stop, self.side) {
            (Some(stop), PositionSide::Long) => price <= stop,
            (Some(stop), PositionSide::Short) => price >= stop,
            (None, _) => false,
        }
    }

    /// Raise the trailing stop to `candidate` if that tightens it
    pub(crate) fn tighten_stop(&mut self, candidate: Price) -> bool {
        let tighter = match (self.trailing_stop, self.side) {
            (None, _) => true,
            (Some(stop), PositionSide::Long) => candidate > stop,
            (Some(stop), PositionSide::Short) => candidate < stop,
        };
        if tighter {
            self.trailing_stop = Some(candidate);
        }
        tighter
    }

    /// Add a further entry fill on the same side
    pub(crate) fn average_in(&mut self, price: Price, qty: Quantity) {
        let total = self.remaining_qty + qty;
        if total.is_zero() {
            return;
        }
        self.entry_price = (self.remaining_qty * self.entry_price + qty * price) / total;
        self.original_qty += qty;
        self.remaining_qty = total;
        if self.is_new_best(price) {
            self.best_price = price;
        }
    }

    /// Reduce the position by an exit fill; returns the net P&L of that exit
    pub(crate) fn record_exit(
        &mut self,
        qty: Quantity,
        price: Price,
        round_trip_fee_pct: Percent,
    ) -> Percent {
        let qty = qty.min(self.remaining_qty);
        let net = self.net_pnl_pct(price, round_trip_fee_pct);
        self.remaining_qty -= qty;
        self.exited_qty += qty;
        self.realized_weighted_pct += qty * net;
        self.state = if self.remaining_qty.is_zero() {
            PositionState::Closed
        } else {
            PositionState::PartialExit
        };
        net
    }

    /// Size-weighted net P&L over the exits so far
    pub fn blended_net_pnl_pct(&self) -> Percent {
        if self.exited_qty.is_zero() {
            return Decimal::ZERO;
        }
        self.realized_weighted_pct / self.exited_qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long(price: Decimal, qty: Decimal) -> Position {
        Position::open(Symbol::new("BTC", "USD"), PositionSide::Long, price, qty, Utc::now())
    }

    #[test]
    fn test_fee_aware_net_pnl() {
        let position = long(dec!(100), dec!(1));
        assert_eq!(position.gross_pnl_pct(dec!(101.50)), dec!(1.5));
        assert_eq!(position.net_pnl_pct(dec!(101.50), dec!(1.4)), dec!(0.1));
    }

    #[test]
    fn test_short_pnl_is_mirrored() {
        let position = Position::open(
            Symbol::new("ETH", "USDT"),
            PositionSide::Short,
            dec!(200),
            dec!(1),
            Utc::now(),
        );
        assert_eq!(position.gross_pnl_pct(dec!(190)), dec!(5));
        assert!(position.is_new_best(dec!(199)));
        assert!(!position.is_new_best(dec!(201)));
    }

    #[test]
    fn test_average_in_weights_entry() {
        let mut position = long(dec!(100), dec!(1));
        position.average_in(dec!(110), dec!(3));
        assert_eq!(position.entry_price, dec!(107.5));
        assert_eq!(position.remaining_qty, dec!(4));
        assert_eq!(position.best_price, dec!(110));
    }

    #[test]
    fn test_blended_pnl_is_size_weighted() {
        let mut position = long(dec!(50), dec!(2));
        position.record_exit(dec!(0.5), dec!(51.20), dec!(1.4));
        assert_eq!(position.state, PositionState::PartialExit);
        position.record_exit(dec!(1.5), dec!(49.50), dec!(1.4));
        assert_eq!(position.state, PositionState::Closed);
        assert_eq!(position.blended_net_pnl_pct(), dec!(-1.55));
    }

    #[test]
    fn test_stop_only_tightens() {
        let mut position = long(dec!(100), dec!(1));
        assert!(position.tighten_stop(dec!(102)));
        assert!(!position.tighten_stop(dec!(101)));
        assert_eq!(position.trailing_stop, Some(dec!(102)));
        assert!(position.trailing_stop_hit(dec!(102)));
        assert!(!position.trailing_stop_hit(dec!(102.01)));
    }
}
