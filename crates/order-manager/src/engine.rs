//! Position lifecycle and exit engine
//!
//! Owns an account's open positions. Each cycle the caller marks positions to
//! the latest prices, asks for exit decisions, executes them through the
//! broker and commits the fills back.
//!
//! Rule precedence per position (exactly one fires per cycle):
//! 1. profit ladder, against net P&L
//! 2. trailing stop
//! 3. hard stop-loss, against gross P&L
//! 4. maximum hold duration

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use meridian_core::{
    AccountId, ExecutionReport, ExitReason, Percent, PositionSide, Price, Quantity, Side, Symbol,
    TradeResult,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::position::{Position, PositionState};
use crate::rules::ExitRules;

/// What the engine wants done with one position
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub position_id: Uuid,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub reason: ExitReason,
    /// Base quantity to exit
    pub quantity: Quantity,
    /// Price the decision was made at
    pub price: Price,
    pub net_pnl_pct: Percent,
    pub full: bool,
    /// Ladder rungs marked fired once this exit is committed
    pub rungs: Vec<usize>,
}

impl ExitDecision {
    /// Order side that closes the position
    pub fn order_side(&self) -> Side {
        self.side.exit_side()
    }
}

/// Confirmed execution of an exit or entry order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub quantity: Quantity,
    pub price: Price,
}

impl Fill {
    pub fn new(quantity: Quantity, price: Price) -> Self {
        Self { quantity, price }
    }

    /// The filled part of an execution report, if there is one
    pub fn from_report(report: &ExecutionReport) -> Option<Self> {
        if !report.has_fills() {
            return None;
        }
        report.avg_price.map(|price| Self::new(report.filled_qty, price))
    }
}

/// Result of comparing local positions with exchange holdings
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reconciliation {
    /// Holdings taken over as new positions
    pub adopted: Vec<Symbol>,
    /// Positions shrunk to what the exchange actually holds
    pub resized: Vec<Symbol>,
    /// Positions the exchange no longer holds
    pub closed: Vec<TradeResult>,
}

/// Exit engine for one account
pub struct ExitEngine {
    account: AccountId,
    rules: ExitRules,
    min_order_notional: Decimal,
    positions: BTreeMap<Symbol, Position>,
}

impl ExitEngine {
    pub fn new(account: AccountId, rules: ExitRules, min_order_notional: Decimal) -> Result<Self> {
        rules.validate()?;
        Ok(Self {
            account,
            rules,
            min_order_notional,
            positions: BTreeMap::new(),
        })
    }

    pub fn rules(&self) -> &ExitRules {
        &self.rules
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn has_position(&self, symbol: &Symbol) -> bool {
        self.positions.contains_key(symbol)
    }

    /// Record a confirmed entry fill. Opens a position or averages into the
    /// existing one on the same side.
    pub fn apply_entry(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        fill: Fill,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        if fill.quantity <= Decimal::ZERO || fill.price <= Decimal::ZERO {
            return Err(Error::InvalidFill(format!(
                "{} @ {} for {}",
                fill.quantity, fill.price, symbol
            )));
        }

        match self.positions.get_mut(symbol) {
            Some(position) if position.side != side => Err(Error::OppositePosition {
                symbol: symbol.clone(),
                existing: position.side,
            }),
            Some(position) => {
                position.average_in(fill.price, fill.quantity);
                info!(
                    "[EXIT] {} added {} {} to {} position, entry now {}",
                    self.account, fill.quantity, symbol, side, position.entry_price
                );
                Ok(position.id)
            }
            None => {
                let position = Position::open(symbol.clone(), side, fill.price, fill.quantity, at);
                let id = position.id;
                info!(
                    "[EXIT] {} opened {} {} {} @ {}",
                    self.account, side, fill.quantity, symbol, fill.price
                );
                self.positions.insert(symbol.clone(), position);
                Ok(id)
            }
        }
    }

    /// Advance best prices and ratchet trailing stops
    pub fn mark_to_market(&mut self, prices: &HashMap<Symbol, Price>) {
        let fee = self.rules.round_trip_fee_pct;
        let Some(trailing) = self.rules.trailing.clone() else {
            for position in self.positions.values_mut() {
                if let Some(&price) = prices.get(&position.symbol) {
                    if position.is_new_best(price) {
                        position.best_price = price;
                    }
                }
            }
            return;
        };

        for position in self.positions.values_mut() {
            let Some(&price) = prices.get(&position.symbol) else {
                continue;
            };
            let new_best = position.is_new_best(price);
            if new_best {
                position.best_price = price;
            }
            // Recomputed only on a new favourable extreme, or on first arming
            if position.trailing_stop.is_some() && !new_best {
                continue;
            }
            if position.net_pnl_pct(position.best_price, fee) < trailing.activation_net_pct {
                continue;
            }
            let candidate = position.entry_price
                + (position.best_price - position.entry_price) * trailing.retention;
            if position.tighten_stop(candidate) {
                debug!(
                    "[EXIT] {} {} trailing stop -> {}",
                    self.account, position.symbol, candidate
                );
            }
        }
    }

    /// Decide whether `symbol`'s position should exit at `price`
    ///
    /// Read-only. Positions with an outstanding exit order are skipped.
    pub fn evaluate(&self, symbol: &Symbol, price: Price, now: DateTime<Utc>) -> Option<ExitDecision> {
        let position = self.positions.get(symbol)?;
        if position.exit_pending || position.remaining_qty <= Decimal::ZERO {
            return None;
        }

        let gross = position.gross_pnl_pct(price);
        let net = gross - self.rules.round_trip_fee_pct;
        let decision = |reason: ExitReason, quantity: Quantity, full: bool, rungs: Vec<usize>| {
            ExitDecision {
                position_id: position.id,
                symbol: symbol.clone(),
                side: position.side,
                reason,
                quantity,
                price,
                net_pnl_pct: net,
                full,
                rungs,
            }
        };

        let crossed: Vec<usize> = self
            .rules
            .profit_ladder
            .iter()
            .enumerate()
            .filter(|(i, rung)| !position.fired_rungs.contains(i) && net >= rung.net_pct)
            .map(|(i, _)| i)
            .collect();
        if let Some(&top) = crossed.last() {
            let share = self.rules.profit_ladder[top].exit_pct / Decimal::ONE_HUNDRED;
            let (quantity, full) = self.sized_exit(position, share, price);
            return Some(decision(ExitReason::ProfitTarget { rung: top }, quantity, full, crossed));
        }

        if position.trailing_stop_hit(price) {
            return Some(decision(ExitReason::TrailingStop, position.remaining_qty, true, vec![]));
        }

        if gross <= -self.rules.stop_loss_pct {
            return Some(decision(ExitReason::StopLoss, position.remaining_qty, true, vec![]));
        }

        if now - position.opened_at >= self.rules.max_hold() {
            return Some(decision(ExitReason::MaxHold, position.remaining_qty, true, vec![]));
        }

        None
    }

    /// Evaluate every position that has a price
    pub fn evaluate_all(
        &self,
        prices: &HashMap<Symbol, Price>,
        now: DateTime<Utc>,
    ) -> Vec<ExitDecision> {
        self.positions
            .keys()
            .filter_map(|symbol| {
                let price = *prices.get(symbol)?;
                self.evaluate(symbol, price, now)
            })
            .collect()
    }

    /// Apply a confirmed exit fill
    ///
    /// Returns the trade result when the position is fully closed.
    pub fn commit_exit(
        &mut self,
        decision: &ExitDecision,
        fill: Fill,
        at: DateTime<Utc>,
    ) -> Result<Option<TradeResult>> {
        let fee = self.rules.round_trip_fee_pct;
        let position = position_for(&mut self.positions, decision)?;
        if fill.quantity <= Decimal::ZERO {
            return Err(Error::InvalidFill(format!(
                "empty exit fill for {}",
                decision.symbol
            )));
        }

        position.exit_pending = false;
        position.fired_rungs.extend(decision.rungs.iter().copied());
        let net = position.record_exit(fill.quantity, fill.price, fee);

        if position.state != PositionState::Closed {
            position.partial_exits += 1;
            info!(
                "[EXIT] {} {} {} {} @ {} (net {:.2}%), {:.0}% remaining",
                self.account,
                decision.reason,
                decision.symbol,
                fill.quantity,
                fill.price,
                net,
                position.remaining_fraction() * Decimal::ONE_HUNDRED
            );
            return Ok(None);
        }

        Ok(self.close(&decision.symbol, decision.reason, at))
    }

    /// Flag a position whose exit order was accepted but not confirmed
    pub fn mark_exit_pending(&mut self, decision: &ExitDecision) -> Result<()> {
        let position = position_for(&mut self.positions, decision)?;
        position.exit_pending = true;
        Ok(())
    }

    /// Settle an unverified exit once its outcome is known
    ///
    /// `fill` is `None` when the order ended without fills; the position is
    /// released for evaluation again.
    pub fn resolve_pending_exit(
        &mut self,
        decision: &ExitDecision,
        fill: Option<Fill>,
        at: DateTime<Utc>,
    ) -> Result<Option<TradeResult>> {
        match fill {
            Some(fill) => self.commit_exit(decision, fill, at),
            None => {
                let position = position_for(&mut self.positions, decision)?;
                position.exit_pending = false;
                warn!(
                    "[EXIT] {} exit of {} ended without fills, position released",
                    self.account, decision.symbol
                );
                Ok(None)
            }
        }
    }

    /// Bring local positions in line with what the exchange holds
    ///
    /// Only long positions are reconciled; spot holdings say nothing about
    /// shorts. Holdings on watched symbols without a local position are
    /// adopted at the current price when worth at least the minimum order.
    pub fn reconcile_holdings(
        &mut self,
        holdings: &BTreeMap<String, Decimal>,
        prices: &HashMap<Symbol, Price>,
        watchlist: &[Symbol],
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let mut report = Reconciliation::default();

        let longs: Vec<Symbol> = self
            .positions
            .values()
            .filter(|p| p.side == PositionSide::Long && !p.exit_pending)
            .map(|p| p.symbol.clone())
            .collect();
        for symbol in longs {
            let held = holdings.get(symbol.base()).copied().unwrap_or_default();
            let Some(position) = self.positions.get_mut(&symbol) else {
                continue;
            };
            if held <= Decimal::ZERO {
                if let Some(&price) = prices.get(&symbol) {
                    let remaining = position.remaining_qty;
                    position.record_exit(remaining, price, self.rules.round_trip_fee_pct);
                }
                warn!(
                    "[EXIT] {} {} no longer held on the exchange, dropping position",
                    self.account, symbol
                );
                if let Some(result) = self.close(&symbol, ExitReason::External, now) {
                    report.closed.push(result);
                }
            } else if held < position.remaining_qty {
                warn!(
                    "[EXIT] {} {} resized {} -> {} to match the exchange",
                    self.account, symbol, position.remaining_qty, held
                );
                position.remaining_qty = held;
                report.resized.push(symbol);
            }
        }

        // One balance per base asset, however many quotes are watched
        let mut covered: HashSet<String> = self
            .positions
            .keys()
            .map(|s| s.base().to_string())
            .collect();
        for symbol in watchlist {
            if covered.contains(symbol.base()) {
                continue;
            }
            let held = holdings.get(symbol.base()).copied().unwrap_or_default();
            let Some(&price) = prices.get(symbol) else {
                continue;
            };
            if held <= Decimal::ZERO || held * price < self.min_order_notional {
                continue;
            }
            info!(
                "[EXIT] {} adopting {} {} held on the exchange @ {}",
                self.account, held, symbol, price
            );
            self.positions.insert(
                symbol.clone(),
                Position::open(symbol.clone(), PositionSide::Long, price, held, now),
            );
            covered.insert(symbol.base().to_string());
            report.adopted.push(symbol.clone());
        }

        report
    }

    /// Quantity for a partial exit of `share` of the remaining size, widened
    /// to a full exit when either part would be below the exchange minimum
    fn sized_exit(&self, position: &Position, share: Decimal, price: Price) -> (Quantity, bool) {
        let remaining = position.remaining_qty;
        if share >= Decimal::ONE {
            return (remaining, true);
        }
        let quantity = (remaining * share).round_dp(8);
        let leftover = remaining - quantity;
        if leftover * price < self.min_order_notional || quantity * price < self.min_order_notional {
            return (remaining, true);
        }
        (quantity, false)
    }

    fn close(&mut self, symbol: &Symbol, reason: ExitReason, at: DateTime<Utc>) -> Option<TradeResult> {
        let position = self.positions.remove(symbol)?;
        let result = TradeResult {
            account: self.account.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            net_pnl_pct: position.blended_net_pnl_pct(),
            exit_reason: reason,
            partial_exits: position.partial_exits,
            closed_at: at,
        };
        info!(
            "[EXIT] {} closed {} {} ({}), net {:.2}% after {} partial exit(s)",
            self.account,
            result.side,
            result.symbol,
            reason,
            result.net_pnl_pct,
            result.partial_exits
        );
        Some(result)
    }
}

fn position_for<'a>(
    positions: &'a mut BTreeMap<Symbol, Position>,
    decision: &ExitDecision,
) -> Result<&'a mut Position> {
    positions
        .get_mut(&decision.symbol)
        .filter(|p| p.id == decision.position_id)
        .ok_or_else(|| Error::UnknownPosition {
            symbol: decision.symbol.clone(),
            id: decision.position_id,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ProfitRung, TrailingRule};
    use meridian_core::ExchangeId;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USD")
    }

    fn engine(rules: ExitRules) -> ExitEngine {
        ExitEngine::new(AccountId::master(ExchangeId::Kraken), rules, dec!(1)).unwrap()
    }

    fn prices(price: Decimal) -> HashMap<Symbol, Price> {
        HashMap::from([(btc(), price)])
    }

    fn single_rung(net_pct: Decimal) -> ExitRules {
        ExitRules {
            round_trip_fee_pct: dec!(1.4),
            profit_ladder: vec![ProfitRung::new(net_pct, dec!(50))],
            trailing: None,
            stop_loss_pct: dec!(5),
            max_hold_minutes: 600,
        }
    }

    #[test]
    fn test_profit_rung_compares_net_not_gross() {
        let now = Utc::now();
        let mut strict = engine(single_rung(dec!(1.0)));
        strict
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), now)
            .unwrap();
        assert!(strict.evaluate(&btc(), dec!(101.50), now).is_none());

        let mut loose = engine(single_rung(dec!(0.05)));
        loose
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), now)
            .unwrap();
        let decision = loose.evaluate(&btc(), dec!(101.50), now).unwrap();
        assert_eq!(decision.reason, ExitReason::ProfitTarget { rung: 0 });
        assert_eq!(decision.net_pnl_pct, dec!(0.1));
        assert_eq!(decision.quantity, dec!(0.5));
    }

    #[test]
    fn test_highest_crossed_rung_consumes_lower_ones() {
        let now = Utc::now();
        let mut engine = engine(ExitRules {
            round_trip_fee_pct: dec!(0),
            trailing: None,
            ..ExitRules::default()
        });
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(4), dec!(100)), now)
            .unwrap();

        let decision = engine.evaluate(&btc(), dec!(101.2), now).unwrap();
        assert_eq!(decision.reason, ExitReason::ProfitTarget { rung: 1 });
        assert_eq!(decision.rungs, vec![0, 1]);
        engine
            .commit_exit(&decision, Fill::new(decision.quantity, dec!(101.2)), now)
            .unwrap();

        // Retracing through rung #1 must not fire it later
        assert!(engine.evaluate(&btc(), dec!(100.6), now).is_none());
    }

    #[test]
    fn test_rung_is_idempotent() {
        let now = Utc::now();
        let mut engine = engine(single_rung(dec!(0.5)));
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(2), dec!(100)), now)
            .unwrap();

        let decision = engine.evaluate(&btc(), dec!(102), now).unwrap();
        let result = engine
            .commit_exit(&decision, Fill::new(dec!(1), dec!(102)), now)
            .unwrap();
        assert!(result.is_none());

        for price in [dec!(102), dec!(103), dec!(104)] {
            assert!(engine.evaluate(&btc(), price, now).is_none());
        }
        assert_eq!(engine.position(&btc()).unwrap().remaining_qty, dec!(1));
    }

    #[test]
    fn test_trailing_stop_only_tightens() {
        let now = Utc::now();
        let mut engine = engine(ExitRules {
            round_trip_fee_pct: dec!(0),
            profit_ladder: vec![],
            trailing: Some(TrailingRule {
                activation_net_pct: dec!(1.0),
                retention: dec!(0.5),
            }),
            stop_loss_pct: dec!(10),
            max_hold_minutes: 600,
        });
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), now)
            .unwrap();

        let mut last_stop = None;
        for price in [dec!(100.5), dec!(104), dec!(103), dec!(106), dec!(104), dec!(108), dec!(105)] {
            engine.mark_to_market(&prices(price));
            let stop = engine.position(&btc()).unwrap().trailing_stop;
            if let (Some(prev), Some(now_stop)) = (last_stop, stop) {
                assert!(now_stop >= prev, "stop loosened from {prev} to {now_stop}");
            }
            last_stop = stop.or(last_stop);
            assert!(engine.evaluate(&btc(), price, now).is_none());
        }
        assert_eq!(last_stop, Some(dec!(104)));

        engine.mark_to_market(&prices(dec!(103.9)));
        let decision = engine.evaluate(&btc(), dec!(103.9), now).unwrap();
        assert_eq!(decision.reason, ExitReason::TrailingStop);
        assert!(decision.full);
    }

    #[test]
    fn test_stop_loss_on_gross_move() {
        let now = Utc::now();
        let mut engine = engine(ExitRules {
            round_trip_fee_pct: dec!(1.4),
            trailing: None,
            ..ExitRules::default()
        });
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), now)
            .unwrap();
        // Net is already -1.4 here but the gross move is flat
        assert!(engine.evaluate(&btc(), dec!(100), now).is_none());
        let decision = engine.evaluate(&btc(), dec!(99), now).unwrap();
        assert_eq!(decision.reason, ExitReason::StopLoss);
    }

    #[test]
    fn test_max_hold_yields_to_profit_target() {
        let opened = Utc::now();
        let mut engine = engine(single_rung(dec!(0.5)));
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), opened)
            .unwrap();
        let late = opened + chrono::Duration::minutes(601);

        let decision = engine.evaluate(&btc(), dec!(102), late).unwrap();
        assert!(matches!(decision.reason, ExitReason::ProfitTarget { .. }));

        let decision = engine.evaluate(&btc(), dec!(100), late).unwrap();
        assert_eq!(decision.reason, ExitReason::MaxHold);
    }

    #[test]
    fn test_dust_remainder_becomes_full_exit() {
        let now = Utc::now();
        let mut engine = ExitEngine::new(
            AccountId::master(ExchangeId::Kraken),
            single_rung(dec!(0.5)),
            dec!(10),
        )
        .unwrap();
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(0.15), dec!(100)), now)
            .unwrap();
        let decision = engine.evaluate(&btc(), dec!(102), now).unwrap();
        assert!(decision.full);
        assert_eq!(decision.quantity, dec!(0.15));
    }

    #[test]
    fn test_pending_exit_blocks_reevaluation() {
        let now = Utc::now();
        let mut engine = engine(single_rung(dec!(0.5)));
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), now)
            .unwrap();
        let decision = engine.evaluate(&btc(), dec!(90), now).unwrap();
        engine.mark_exit_pending(&decision).unwrap();
        assert!(engine.evaluate(&btc(), dec!(90), now).is_none());

        engine.resolve_pending_exit(&decision, None, now).unwrap();
        assert!(engine.evaluate(&btc(), dec!(90), now).is_some());

        let result = engine
            .resolve_pending_exit(&decision, Some(Fill::new(dec!(1), dec!(90))), now)
            .unwrap()
            .unwrap();
        assert_eq!(result.exit_reason, ExitReason::StopLoss);
        assert!(!engine.has_position(&btc()));
    }

    #[test]
    fn test_opposite_entry_rejected() {
        let now = Utc::now();
        let mut engine = engine(ExitRules::default());
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), now)
            .unwrap();
        let err = engine
            .apply_entry(&btc(), PositionSide::Short, Fill::new(dec!(1), dec!(100)), now)
            .unwrap_err();
        assert!(matches!(err, Error::OppositePosition { .. }));
    }

    #[test]
    fn test_reconcile_adopts_and_drops() {
        let now = Utc::now();
        let eth = Symbol::new("ETH", "USD");
        let mut engine = engine(ExitRules::default());
        engine
            .apply_entry(&btc(), PositionSide::Long, Fill::new(dec!(1), dec!(100)), now)
            .unwrap();

        let holdings = BTreeMap::from([("ETH".to_string(), dec!(2))]);
        let marks = HashMap::from([(btc(), dec!(101)), (eth.clone(), dec!(20))]);
        let report = engine.reconcile_holdings(&holdings, &marks, &[btc(), eth.clone()], now);

        assert_eq!(report.adopted, vec![eth.clone()]);
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].exit_reason, ExitReason::External);
        assert!(!engine.has_position(&btc()));
        assert_eq!(engine.position(&eth).unwrap().entry_price, dec!(20));
    }

    #[test]
    fn test_reconcile_adopts_a_base_asset_once() {
        let now = Utc::now();
        let btc_usdt = Symbol::new("BTC", "USDT");
        let mut engine = engine(ExitRules::default());

        let holdings = BTreeMap::from([("BTC".to_string(), dec!(0.5))]);
        let marks = HashMap::from([(btc(), dec!(100)), (btc_usdt.clone(), dec!(100))]);
        let report = engine.reconcile_holdings(&holdings, &marks, &[btc(), btc_usdt.clone()], now);

        assert_eq!(report.adopted, vec![btc()]);
        assert_eq!(engine.open_count(), 1);
        assert!(!engine.has_position(&btc_usdt));

        // Already held under BTC-USD, so the next pass adopts nothing
        let again = engine.reconcile_holdings(&holdings, &marks, &[btc_usdt, btc()], now);
        assert!(again.adopted.is_empty());
        assert_eq!(engine.open_count(), 1);
    }
}
