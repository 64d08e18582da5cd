//! Account Supervisor - one trading loop per funded account
//!
//! Each supervisor owns its account's positions, pending orders and risk
//! state outright. Nothing here is shared with other accounts; the only
//! cross-account coupling is the nonce authority inside the adapter.
//!
//! A cycle runs, in order:
//! 1. connect if the adapter lost its connection
//! 2. refresh the balance
//! 3. settle pending orders, first looking up submissions that ended
//!    without an answer
//! 4. fetch candles, value the account, feed equity to the governor and
//!    reconcile positions against exchange holdings
//! 5. evaluate exits, only on symbols priced this cycle
//! 6. evaluate entries
//! 7. publish status
//!
//! A failed cycle marks the task degraded and is retried after the usual
//! interval. It never ends the task.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use meridian_clock::Clock;
use meridian_core::{
    AccountId, Candle, OrderRequest, OrderSize, PositionSide, Price, Symbol, Timeframe, TradeResult,
};
use meridian_gateway::{Balance, BrokerAdapter, BrokerError, BrokerResult, Execution};
use meridian_order_manager::{
    ExitDecision, ExitEngine, ExitRules, Fill, OrderIntent, PendingOrder, PendingOrders, Resolution,
};
use meridian_risk_manager::{
    EntryDecision, EntryRequest, GovernorConfig, MarketConditions, RiskGovernor,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::config::{EngineConfig, ExchangeSettings};
use crate::error::EngineError;
use crate::status::{AccountStatus, PositionStatus, TaskHealth};
use crate::strategy::{Strategy, StrategyInput};

/// Loop settings for one account
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub symbols: Vec<Symbol>,
    pub timeframe: Timeframe,
    pub candle_count: usize,
    pub cycle_interval: Duration,
    pub pending_expiry: chrono::Duration,
}

impl SupervisorSettings {
    pub fn new(config: &EngineConfig, exchange: &ExchangeSettings) -> Self {
        Self {
            symbols: exchange.symbols.clone(),
            timeframe: config.candle_timeframe,
            candle_count: config.candle_count,
            cycle_interval: config.cycle_interval(),
            pending_expiry: config.pending_expiry(),
        }
    }
}

pub struct AccountSupervisor {
    adapter: Arc<BrokerAdapter>,
    engine: ExitEngine,
    pending: PendingOrders,
    governor: RiskGovernor,
    strategy: Arc<dyn Strategy>,
    settings: SupervisorSettings,
    clock: Arc<dyn Clock>,
    status_tx: watch::Sender<AccountStatus>,
    trades_tx: broadcast::Sender<TradeResult>,
    health: TaskHealth,
    consecutive_failures: u32,
    cycles: u64,
    last_cycle_at: Option<DateTime<Utc>>,
    last_skip: Option<String>,
    balance: Option<Balance>,
    prices: HashMap<Symbol, Price>,
}

impl AccountSupervisor {
    /// Returns the supervisor and the receiving end of its status channel
    pub fn new(
        adapter: Arc<BrokerAdapter>,
        exit_rules: ExitRules,
        risk: GovernorConfig,
        strategy: Arc<dyn Strategy>,
        settings: SupervisorSettings,
        clock: Arc<dyn Clock>,
        trades_tx: broadcast::Sender<TradeResult>,
    ) -> Result<(Self, watch::Receiver<AccountStatus>), EngineError> {
        let account = adapter.account().clone();
        let engine = ExitEngine::new(account.clone(), exit_rules, adapter.rules().min_order_notional)
            .map_err(|e| EngineError::Setup {
                account: account.clone(),
                reason: e.to_string(),
            })?;
        let governor = RiskGovernor::new(account.clone(), risk).map_err(|e| EngineError::Setup {
            account: account.clone(),
            reason: e.to_string(),
        })?;

        let initial = AccountStatus {
            account,
            cash: Decimal::ZERO,
            equity: Decimal::ZERO,
            balance_stale: false,
            positions: Vec::new(),
            pending_orders: 0,
            risk: governor.snapshot(clock.now()),
            health: TaskHealth::Healthy,
            cycles: 0,
            last_cycle_at: None,
            last_skip: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        Ok((
            Self {
                adapter,
                engine,
                pending: PendingOrders::new(),
                governor,
                strategy,
                settings,
                clock,
                status_tx,
                trades_tx,
                health: TaskHealth::Healthy,
                consecutive_failures: 0,
                cycles: 0,
                last_cycle_at: None,
                last_skip: None,
                balance: None,
                prices: HashMap::new(),
            },
            status_rx,
        ))
    }

    pub fn account(&self) -> &AccountId {
        self.adapter.account()
    }

    /// Start out degraded after a transient failure during discovery
    pub fn start_degraded(&mut self, reason: String) {
        self.consecutive_failures = 1;
        self.health = TaskHealth::Degraded {
            reason,
            consecutive_failures: 1,
        };
        self.publish_status();
    }

    pub fn health(&self) -> &TaskHealth {
        &self.health
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn positions(&self) -> &ExitEngine {
        &self.engine
    }

    pub fn pending(&self) -> &PendingOrders {
        &self.pending
    }

    pub fn governor(&self) -> &RiskGovernor {
        &self.governor
    }

    /// Run until the shutdown flag turns true, then return the final status
    ///
    /// The flag is checked between cycles and wakes the inter-cycle sleep; a
    /// cycle in progress always finishes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AccountStatus {
        info!(
            "[SUPERVISOR] {} started: {} symbols every {:?}, strategy {}",
            self.account(),
            self.settings.symbols.len(),
            self.settings.cycle_interval,
            self.strategy.name()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(self.settings.cycle_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            "[SUPERVISOR] {} stopped after {} cycles, {} pending orders left on the exchange",
            self.account(),
            self.cycles,
            self.pending.len()
        );
        self.status()
    }

    /// One full cycle, with the outcome folded into task health
    pub async fn cycle(&mut self) {
        let result = self.run_cycle().await;
        self.cycles += 1;
        self.last_cycle_at = Some(self.clock.now());

        match result {
            Ok(()) => {
                if !self.health.is_healthy() {
                    info!(
                        "[SUPERVISOR] {} recovered after {} failed cycles",
                        self.account(),
                        self.consecutive_failures
                    );
                }
                self.consecutive_failures = 0;
                self.health = TaskHealth::Healthy;
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if err.is_transient() {
                    warn!(
                        "[SUPERVISOR] {} cycle failed ({} in a row): {}",
                        self.account(),
                        self.consecutive_failures,
                        err
                    );
                } else {
                    error!(
                        "[SUPERVISOR] {} cycle failed ({} in a row): {}",
                        self.account(),
                        self.consecutive_failures,
                        err
                    );
                }
                self.health = TaskHealth::Degraded {
                    reason: err.to_string(),
                    consecutive_failures: self.consecutive_failures,
                };
            }
        }
        self.publish_status();
    }

    async fn run_cycle(&mut self) -> BrokerResult<()> {
        let now = self.clock.now();

        if !self.adapter.is_connected() {
            self.adapter.connect().await?;
        }

        let balance = self.adapter.get_balance().await?;
        self.balance = Some(balance.clone());

        let settled_fills = self.settle_pending(now).await;

        let candles = self.fetch_candles().await?;
        let equity = self.equity(&balance);
        self.governor.update_equity(equity);

        // Holdings were read before any fill settled above, so they are
        // only trusted on a quiet cycle
        if !balance.stale && !settled_fills {
            let watchlist: Vec<Symbol> = self
                .settings
                .symbols
                .iter()
                .filter(|s| !self.pending.has_entry_for(s))
                .cloned()
                .collect();
            let reconciliation =
                self.engine
                    .reconcile_holdings(&balance.holdings, &self.prices, &watchlist, now);
            for result in reconciliation.closed {
                self.record_trade(result, now);
            }
        }

        let marks: HashMap<Symbol, Price> = candles
            .iter()
            .filter_map(|(symbol, series)| series.last().map(|c| (symbol.clone(), c.close)))
            .collect();
        self.run_exits(&marks, now).await?;
        self.run_entries(&candles, balance.cash, now).await
    }

    /// Ask the exchange about every pending order. Returns whether any fill
    /// was applied.
    async fn settle_pending(&mut self, now: DateTime<Utc>) -> bool {
        self.look_up_unconfirmed(now).await;

        let mut filled = false;
        for handle in self.pending.handles() {
            let report = match self.adapter.order_status(&handle).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(
                        "[SUPERVISOR] {} status of pending {} unavailable: {}",
                        self.account(),
                        handle.order_id,
                        err
                    );
                    continue;
                }
            };
            match self.pending.resolve(&report, now, self.settings.pending_expiry) {
                Resolution::Filled(order, fill) => {
                    filled = true;
                    self.apply_resolution(order.intent, Some(fill), now);
                }
                Resolution::Released(order) => self.apply_resolution(order.intent, None, now),
                Resolution::Expired(order) => filled |= self.expire(order, now).await,
                Resolution::Waiting => {}
            }
        }
        filled
    }

    /// Retry lookups of submissions that ended without an answer
    ///
    /// A found order becomes a tracked pending order. One the exchange does
    /// not know was never placed. A lookup that keeps failing past the
    /// pending expiry is given up; holdings reconciliation covers the rest.
    async fn look_up_unconfirmed(&mut self, now: DateTime<Utc>) {
        for order in self.pending.unconfirmed() {
            let found = self
                .adapter
                .find_order(&order.symbol, order.client_order_id)
                .await;
            match found {
                Ok(Some(handle)) => {
                    info!(
                        "[SUPERVISOR] {} found order {} for {}",
                        self.account(),
                        handle.order_id,
                        order.symbol
                    );
                    self.pending.take_unconfirmed(&order.client_order_id);
                    self.pending.track(handle, order.intent, order.submitted_at);
                }
                Ok(None) => {
                    info!(
                        "[SUPERVISOR] {} order {} for {} never reached the exchange",
                        self.account(),
                        order.client_order_id,
                        order.symbol
                    );
                    self.pending.take_unconfirmed(&order.client_order_id);
                    self.apply_resolution(order.intent, None, now);
                }
                Err(err) if now - order.submitted_at >= self.settings.pending_expiry => {
                    error!(
                        "[SUPERVISOR] {} giving up on order {} for {}: {}",
                        self.account(),
                        order.client_order_id,
                        order.symbol,
                        err
                    );
                    self.pending.take_unconfirmed(&order.client_order_id);
                    self.apply_resolution(order.intent, None, now);
                }
                Err(err) => warn!(
                    "[SUPERVISOR] {} lookup of {} failed, retrying next cycle: {}",
                    self.account(),
                    order.client_order_id,
                    err
                ),
            }
        }
    }

    /// Look up an order whose placement failed ambiguously
    ///
    /// Returns true when the order is, or may still be, on the exchange; it
    /// is then tracked as pending or queued for another lookup.
    async fn recover_placement(
        &mut self,
        request: &OrderRequest,
        intent: OrderIntent,
        err: &BrokerError,
        now: DateTime<Utc>,
    ) -> bool {
        warn!(
            "[SUPERVISOR] {} {} {} may have reached the exchange ({}), looking it up",
            self.account(),
            request.side,
            request.symbol,
            err
        );
        match self
            .adapter
            .find_order(&request.symbol, request.client_order_id)
            .await
        {
            Ok(Some(handle)) => {
                self.pending.track(handle, intent, now);
                true
            }
            Ok(None) => false,
            Err(lookup) => {
                warn!(
                    "[SUPERVISOR] {} lookup of {} failed: {}",
                    self.account(),
                    request.client_order_id,
                    lookup
                );
                self.pending.track_unconfirmed(
                    request.symbol.clone(),
                    request.client_order_id,
                    intent,
                    now,
                );
                true
            }
        }
    }

    /// Cancel a pending order that outlived its expiry
    async fn expire(&mut self, order: PendingOrder, now: DateTime<Utc>) -> bool {
        warn!(
            "[SUPERVISOR] {} pending {} expired, canceling",
            self.account(),
            order.handle.order_id
        );
        if let Err(err) = self.adapter.cancel_order(&order.handle).await {
            warn!(
                "[SUPERVISOR] {} cancel of {} failed, still tracking: {}",
                self.account(),
                order.handle.order_id,
                err
            );
            self.pending.track(order.handle, order.intent, order.submitted_at);
            return false;
        }

        // A cancel can race a fill
        let fill = match self.adapter.order_status(&order.handle).await {
            Ok(report) => Fill::from_report(&report),
            Err(_) => None,
        };
        let filled = fill.is_some();
        self.apply_resolution(order.intent, fill, now);
        filled
    }

    fn apply_resolution(&mut self, intent: OrderIntent, fill: Option<Fill>, now: DateTime<Utc>) {
        match intent {
            OrderIntent::Entry { symbol, side } => match fill {
                Some(fill) => {
                    if let Err(err) = self.engine.apply_entry(&symbol, side, fill, now) {
                        error!("[SUPERVISOR] {} pending entry fill not applied: {}", self.account(), err);
                    }
                }
                None => info!(
                    "[SUPERVISOR] {} pending entry on {} ended without fills",
                    self.account(),
                    symbol
                ),
            },
            OrderIntent::Exit(decision) => {
                match self.engine.resolve_pending_exit(&decision, fill, now) {
                    Ok(Some(result)) => self.record_trade(result, now),
                    Ok(None) => {}
                    Err(err) => error!(
                        "[SUPERVISOR] {} pending exit on {} not applied: {}",
                        self.account(),
                        decision.symbol,
                        err
                    ),
                }
            }
        }
    }

    async fn fetch_candles(&mut self) -> BrokerResult<HashMap<Symbol, Vec<Candle>>> {
        let mut all = HashMap::new();
        let mut last_error = None;

        for symbol in &self.settings.symbols {
            match self
                .adapter
                .get_candles(symbol, self.settings.timeframe, self.settings.candle_count)
                .await
            {
                Ok(candles) => {
                    if let Some(last) = candles.last() {
                        self.prices.insert(symbol.clone(), last.close);
                        all.insert(symbol.clone(), candles);
                    }
                }
                Err(err) => {
                    warn!("[SUPERVISOR] {} no candles for {}: {}", self.account(), symbol, err);
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if all.is_empty() || !self.adapter.is_connected() => Err(err),
            _ => Ok(all),
        }
    }

    /// Exits are judged only against `marks`, the closes fetched this cycle
    async fn run_exits(
        &mut self,
        marks: &HashMap<Symbol, Price>,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        self.engine.mark_to_market(marks);

        for decision in self.engine.evaluate_all(marks, now) {
            let request = OrderRequest::market(
                decision.symbol.clone(),
                decision.order_side(),
                OrderSize::Base(decision.quantity),
            );
            match self.adapter.place_order(&request, decision.price).await {
                Ok(Execution::Filled(report)) => match Fill::from_report(&report) {
                    Some(fill) => self.commit_exit(&decision, fill, now),
                    None => warn!(
                        "[SUPERVISOR] {} exit on {} reported filled without quantity",
                        self.account(),
                        decision.symbol
                    ),
                },
                Ok(Execution::Pending(handle)) => {
                    if let Err(err) = self.engine.mark_exit_pending(&decision) {
                        error!("[SUPERVISOR] {} {}", self.account(), err);
                    }
                    self.pending.track(handle, OrderIntent::Exit(decision), now);
                }
                Err(err) if err.is_ambiguous() => {
                    let intent = OrderIntent::Exit(decision.clone());
                    if self.recover_placement(&request, intent, &err, now).await {
                        if let Err(mark_err) = self.engine.mark_exit_pending(&decision) {
                            error!("[SUPERVISOR] {} {}", self.account(), mark_err);
                        }
                    } else {
                        self.skip(format!("exit {} ({}): {}", decision.symbol, decision.reason, err));
                    }
                    if !self.adapter.is_connected() {
                        return Err(err);
                    }
                }
                Err(err) => {
                    self.skip(format!("exit {} ({}): {}", decision.symbol, decision.reason, err));
                    if !self.adapter.is_connected() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn commit_exit(&mut self, decision: &ExitDecision, fill: Fill, now: DateTime<Utc>) {
        match self.engine.commit_exit(decision, fill, now) {
            Ok(Some(result)) => self.record_trade(result, now),
            Ok(None) => {}
            Err(err) => error!(
                "[SUPERVISOR] {} exit fill on {} not applied: {}",
                self.account(),
                decision.symbol,
                err
            ),
        }
    }

    async fn run_entries(
        &mut self,
        candles: &HashMap<Symbol, Vec<Candle>>,
        cash: Decimal,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        let atr_period = self.governor.config().mode.atr_period;
        let mut cash = cash;

        // Mode on the lead symbol, so status shows it even when nothing enters
        if let Some(lead) = self.settings.symbols.first() {
            let conditions = candles
                .get(lead)
                .and_then(|c| MarketConditions::from_candles(c, atr_period));
            self.governor.select_mode(conditions.as_ref(), now);
        }

        for symbol in self.settings.symbols.clone() {
            if self.engine.has_position(&symbol) || self.pending.has_entry_for(&symbol) {
                continue;
            }
            let (Some(series), Some(&price)) = (candles.get(&symbol), self.prices.get(&symbol)) else {
                continue;
            };

            let decision = self.strategy.evaluate(&StrategyInput {
                account: self.adapter.account(),
                symbol: &symbol,
                candles: series,
                open_positions: self.engine.open_count(),
                cash,
            });
            let Some(side) = decision.signal.side() else {
                continue;
            };
            if side == PositionSide::Short && !self.adapter.rules().allow_short {
                self.skip(format!(
                    "{}: short entries are not allowed on {}",
                    symbol,
                    self.adapter.exchange()
                ));
                continue;
            }

            let request = EntryRequest {
                symbol: symbol.clone(),
                conditions: MarketConditions::from_candles(series, atr_period),
                strategy_pct: decision.size_pct,
                quality: decision.quality,
                cash,
                open_positions: self.engine.open_count() + self.pending.entry_count(),
                min_order_notional: self.adapter.rules().min_order_notional,
            };
            let quote_size = match self.governor.assess_entry(&request, now) {
                EntryDecision::Allowed { quote_size, .. } => quote_size,
                EntryDecision::Vetoed(reason) => {
                    self.skip(format!("{symbol}: {reason}"));
                    continue;
                }
            };

            let order = OrderRequest::market(symbol.clone(), side.entry_side(), OrderSize::Quote(quote_size));
            match self.adapter.place_order(&order, price).await {
                Ok(Execution::Filled(report)) => {
                    cash -= quote_size;
                    if let Some(fill) = Fill::from_report(&report) {
                        if let Err(err) = self.engine.apply_entry(&symbol, side, fill, now) {
                            error!("[SUPERVISOR] {} entry fill not applied: {}", self.account(), err);
                        }
                    }
                }
                Ok(Execution::Pending(handle)) => {
                    cash -= quote_size;
                    self.pending
                        .track(handle, OrderIntent::Entry { symbol: symbol.clone(), side }, now);
                }
                Err(err) if err.is_ambiguous() => {
                    let intent = OrderIntent::Entry { symbol: symbol.clone(), side };
                    if self.recover_placement(&order, intent, &err, now).await {
                        cash -= quote_size;
                    } else {
                        self.skip(format!("{symbol}: {err}"));
                    }
                    if !self.adapter.is_connected() {
                        return Err(err);
                    }
                }
                Err(err) => {
                    self.skip(format!("{symbol}: {err}"));
                    if !self.adapter.is_connected() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn record_trade(&mut self, result: TradeResult, now: DateTime<Utc>) {
        info!(
            "[SUPERVISOR] {} closed {} {}: net {:.2}% ({}, {} partial exits)",
            result.account,
            result.symbol,
            result.side,
            result.net_pnl_pct,
            result.exit_reason,
            result.partial_exits
        );
        self.governor.record_outcome(&result, now);
        // No subscribers is fine
        let _ = self.trades_tx.send(result);
    }

    fn skip(&mut self, reason: String) {
        debug!("[SUPERVISOR] {} skipped {}", self.account(), reason);
        self.last_skip = Some(reason);
    }

    /// Cash plus watched holdings at their latest mark
    fn equity(&self, balance: &Balance) -> Decimal {
        let holdings: Decimal = balance
            .holdings
            .iter()
            .filter_map(|(asset, qty)| {
                self.prices
                    .iter()
                    .find(|(symbol, _)| symbol.base() == asset)
                    .map(|(_, price)| qty * price)
            })
            .sum();
        balance.cash + holdings
    }

    pub fn status(&self) -> AccountStatus {
        let fee = self.engine.rules().round_trip_fee_pct;
        let mut positions: Vec<PositionStatus> = self
            .engine
            .positions()
            .map(|p| {
                let mark = self.prices.get(&p.symbol).copied();
                PositionStatus {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    entry_price: p.entry_price,
                    remaining_qty: p.remaining_qty,
                    mark_price: mark,
                    net_pnl_pct: mark.map(|price| p.net_pnl_pct(price, fee)),
                    state: p.state,
                    exit_pending: p.exit_pending,
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let (cash, stale) = self
            .balance
            .as_ref()
            .map(|b| (b.cash, b.stale))
            .unwrap_or((Decimal::ZERO, false));

        AccountStatus {
            account: self.account().clone(),
            cash,
            equity: self.governor.equity(),
            balance_stale: stale,
            positions,
            pending_orders: self.pending.len(),
            risk: self.governor.snapshot(self.clock.now()),
            health: self.health.clone(),
            cycles: self.cycles,
            last_cycle_at: self.last_cycle_at,
            last_skip: self.last_skip.clone(),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }
}
