//! In-process simulated exchange
//!
//! Backs paper trading and every test above the gateway. It behaves like a
//! strict spot exchange: it validates nonces (optionally shared across
//! accounts through a [`PaperNonceGate`]), checks funds, charges a per-side
//! fee and keeps an order book of its own. Faults can be injected per
//! operation to exercise retry, fallback and reconciliation paths.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use log::{debug, info};
use meridian_clock::Clock;
use meridian_core::{
    Candle, ExchangeId, ExecutionReport, OrderHandle, OrderRequest, OrderSize, OrderStatus,
    OrderType, Percent, Price, Quantity, Side, Symbol, Timeframe,
};
use meridian_nonce::NonceIssuer;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{Balances, VenueApi};
use crate::error::{BrokerError, BrokerResult};

/// Operations faults can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Connect,
    Balances,
    Candles,
    Place,
    Status,
    Find,
    Cancel,
}

/// When accepted market orders fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Fill at the current price on acceptance
    #[default]
    Immediate,
    /// Rest as open until [`PaperVenue::settle_open_orders`]
    Deferred,
}

/// Seeded random-walk price source for unattended paper runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticFeed {
    pub start_price: Price,
    /// Largest move per bar, in percent
    pub max_step_pct: Percent,
    pub seed: u64,
}

impl Default for SyntheticFeed {
    fn default() -> Self {
        Self {
            start_price: Decimal::from(100),
            max_step_pct: Decimal::new(5, 1),
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Fee charged per side, in percent of notional
    pub fee_pct: Percent,
    pub starting_cash: Decimal,
    /// Asset the starting cash is deposited in
    pub cash_asset: String,
    pub synthetic_feed: Option<SyntheticFeed>,
    /// Simulated round-trip latency of privileged calls
    pub latency: Duration,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            fee_pct: Decimal::new(26, 2),
            starting_cash: Decimal::from(1_000),
            cash_asset: "USD".to_string(),
            synthetic_feed: None,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    last_nonce: u64,
    accepted: Vec<u64>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Nonce validation shared by every paper account of one exchange
///
/// Mirrors an exchange that requires strictly increasing nonces and records
/// how many privileged requests were ever in flight at once.
#[derive(Debug, Default)]
pub struct PaperNonceGate {
    state: Mutex<GateState>,
}

impl PaperNonceGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, nonce: u64) -> BrokerResult<GateGuard<'_>> {
        let mut state = self.state.lock();
        if nonce <= state.last_nonce {
            return Err(BrokerError::InvalidNonce(format!(
                "nonce {} not above {}",
                nonce, state.last_nonce
            )));
        }
        state.last_nonce = nonce;
        state.accepted.push(nonce);
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Ok(GateGuard { gate: self })
    }

    /// Nonces in the order they were accepted
    pub fn accepted(&self) -> Vec<u64> {
        self.state.lock().accepted.clone()
    }

    /// Highest number of privileged requests observed in flight together
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

struct GateGuard<'a> {
    gate: &'a PaperNonceGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().in_flight -= 1;
    }
}

struct PaperOrder {
    request: OrderRequest,
    report: ExecutionReport,
}

struct PaperBook {
    assets: Balances,
    prices: HashMap<Symbol, Price>,
    candles: HashMap<Symbol, Vec<Candle>>,
    orders: HashMap<String, PaperOrder>,
    next_order_id: u64,
    fill_mode: FillMode,
    faults: HashMap<PaperOp, VecDeque<BrokerError>>,
    persistent_fault: Option<BrokerError>,
    lose_next_ack: bool,
    calls: HashMap<PaperOp, u32>,
    rng: StdRng,
}

/// Simulated spot exchange for one account
pub struct PaperVenue {
    exchange: ExchangeId,
    config: PaperConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<PaperNonceGate>,
    book: Mutex<PaperBook>,
}

impl PaperVenue {
    pub fn new(exchange: ExchangeId, config: PaperConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_gate(exchange, config, clock, PaperNonceGate::new())
    }

    /// Share nonce validation with other paper accounts on the same exchange
    pub fn with_gate(
        exchange: ExchangeId,
        config: PaperConfig,
        clock: Arc<dyn Clock>,
        gate: Arc<PaperNonceGate>,
    ) -> Arc<Self> {
        let mut assets = Balances::default();
        assets.add(config.cash_asset.to_ascii_uppercase(), config.starting_cash);
        let seed = config.synthetic_feed.as_ref().map(|f| f.seed).unwrap_or(0);
        Arc::new(Self {
            exchange,
            config,
            clock,
            gate,
            book: Mutex::new(PaperBook {
                assets,
                prices: HashMap::new(),
                candles: HashMap::new(),
                orders: HashMap::new(),
                next_order_id: 1,
                fill_mode: FillMode::Immediate,
                faults: HashMap::new(),
                persistent_fault: None,
                lose_next_ack: false,
                calls: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        })
    }

    pub fn gate(&self) -> &Arc<PaperNonceGate> {
        &self.gate
    }

    // ---- market control -------------------------------------------------

    /// Move the market: records a new bar closing at `price` and fills any
    /// resting orders it crosses
    pub fn set_price(&self, symbol: &Symbol, price: Price) {
        let now = self.clock.now();
        let mut book = self.book.lock();
        let open = book.prices.get(symbol).copied().unwrap_or(price);
        book.candles.entry(symbol.clone()).or_default().push(Candle {
            timestamp: now,
            open,
            high: open.max(price),
            low: open.min(price),
            close: price,
            volume: Decimal::ONE,
        });
        book.prices.insert(symbol.clone(), price);
        if book.fill_mode == FillMode::Immediate {
            self.fill_crossed(&mut book, symbol, price);
        }
    }

    /// Replace the candle history for `symbol`; the last close becomes the price
    pub fn set_candles(&self, symbol: &Symbol, candles: Vec<Candle>) {
        let mut book = self.book.lock();
        if let Some(last) = candles.last() {
            book.prices.insert(symbol.clone(), last.close);
        }
        book.candles.insert(symbol.clone(), candles);
    }

    pub fn price(&self, symbol: &Symbol) -> Option<Price> {
        self.book.lock().prices.get(symbol).copied()
    }

    // ---- account control ------------------------------------------------

    pub fn asset(&self, asset: &str) -> Decimal {
        self.book.lock().assets.get(&asset.to_ascii_uppercase())
    }

    /// Overwrite an asset balance (deposits, withdrawals, manual closes)
    pub fn set_asset(&self, asset: &str, amount: Decimal) {
        self.book
            .lock()
            .assets
            .assets
            .insert(asset.to_ascii_uppercase(), amount);
    }

    // ---- behaviour control ----------------------------------------------

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.book.lock().fill_mode = mode;
    }

    /// Fail the next call of `op` with `error`. Queued errors are consumed in order.
    pub fn inject_fault(&self, op: PaperOp, error: BrokerError) {
        self.book.lock().faults.entry(op).or_default().push_back(error);
    }

    /// Fail every call until cleared
    pub fn set_persistent_fault(&self, error: Option<BrokerError>) {
        self.book.lock().persistent_fault = error;
    }

    /// Accept the next order but report a timeout instead of the acknowledgement
    pub fn lose_next_ack(&self) {
        self.book.lock().lose_next_ack = true;
    }

    pub fn calls(&self, op: PaperOp) -> u32 {
        self.book.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of distinct orders the venue has accepted
    pub fn orders_accepted(&self) -> usize {
        self.book.lock().orders.len()
    }

    /// Fill every open market order at the current price
    pub fn settle_open_orders(&self) {
        let mut book = self.book.lock();
        let open: Vec<String> = book
            .orders
            .iter()
            .filter(|(_, o)| o.report.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        for id in open {
            let Some(order) = book.orders.get(&id) else {
                continue;
            };
            let symbol = order.request.symbol.clone();
            let Some(price) = book.prices.get(&symbol).copied() else {
                continue;
            };
            if order.request.order_type == OrderType::Market || crosses(&order.request, price) {
                self.execute(&mut book, &id, price);
            }
        }
    }

    // ---- internals ------------------------------------------------------

    fn check_fault(&self, op: PaperOp) -> BrokerResult<()> {
        let mut book = self.book.lock();
        *book.calls.entry(op).or_default() += 1;
        if let Some(err) = book.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            debug!("[PAPER] {} injected fault on {:?}: {}", self.exchange, op, err);
            return Err(err);
        }
        if let Some(err) = &book.persistent_fault {
            return Err(err.clone());
        }
        Ok(())
    }

    async fn privileged<T>(
        &self,
        op: PaperOp,
        nonces: &NonceIssuer,
        f: impl FnOnce(&mut PaperBook) -> BrokerResult<T>,
    ) -> BrokerResult<T> {
        self.check_fault(op)?;
        let _in_flight = self.gate.enter(nonces.next())?;
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        let mut book = self.book.lock();
        f(&mut book)
    }

    fn fill_crossed(&self, book: &mut PaperBook, symbol: &Symbol, price: Price) {
        let crossed: Vec<String> = book
            .orders
            .iter()
            .filter(|(_, o)| {
                o.report.status.is_active()
                    && &o.request.symbol == symbol
                    && crosses(&o.request, price)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in crossed {
            self.execute(book, &id, price);
        }
    }

    /// Fill order `id` completely at `price`, or reject it if funds ran out
    fn execute(&self, book: &mut PaperBook, id: &str, price: Price) {
        let Some(order) = book.orders.get(id) else {
            return;
        };
        let request = order.request.clone();
        let qty = base_quantity(&request, price);
        let notional = qty * price;
        let fee = (notional * self.config.fee_pct / Decimal::ONE_HUNDRED).round_dp(8);
        let base = request.symbol.base().to_string();
        let quote = request.symbol.quote().to_string();

        let funded = match request.side {
            Side::Buy => book.assets.get(&quote) >= notional + fee,
            Side::Sell => book.assets.get(&base) >= qty,
        };
        let status = if !funded {
            OrderStatus::Rejected
        } else {
            match request.side {
                Side::Buy => {
                    book.assets.add(quote, -(notional + fee));
                    book.assets.add(base, qty);
                }
                Side::Sell => {
                    book.assets.add(base, -qty);
                    book.assets.add(quote, notional - fee);
                }
            }
            OrderStatus::Filled
        };

        if let Some(order) = book.orders.get_mut(id) {
            order.report.status = status;
            if status == OrderStatus::Filled {
                order.report.filled_qty = qty;
                order.report.avg_price = Some(price);
                order.report.fee = fee;
            }
        }
        debug!(
            "[PAPER] {} order {} {:?}: {} {} {} @ {}",
            self.exchange, id, status, request.side, qty, request.symbol, price
        );
    }

    fn next_synthetic_bar(&self, book: &mut PaperBook, symbol: &Symbol) {
        let Some(feed) = &self.config.synthetic_feed else {
            return;
        };
        let open = book
            .prices
            .get(symbol)
            .copied()
            .unwrap_or(feed.start_price);
        let max_bps = (feed.max_step_pct * Decimal::ONE_HUNDRED)
            .to_i64()
            .unwrap_or(0)
            .clamp(0, 10_000);
        let step_bps = book.rng.gen_range(-max_bps..=max_bps);
        let close = (open * (Decimal::ONE + Decimal::new(step_bps, 4))).round_dp(8);
        let wick = Decimal::new(book.rng.gen_range(0..=max_bps.max(1)), 5);
        let volume = Decimal::from(book.rng.gen_range(1..=100u32));

        let candles = book.candles.entry(symbol.clone()).or_default();
        let timestamp = candles
            .last()
            .map(|c| c.timestamp + ChronoDuration::minutes(5))
            .unwrap_or_else(|| self.clock.now());
        candles.push(Candle {
            timestamp,
            open,
            high: open.max(close) * (Decimal::ONE + wick),
            low: open.min(close) * (Decimal::ONE - wick),
            close,
            volume,
        });
        book.prices.insert(symbol.clone(), close);
        if book.fill_mode == FillMode::Immediate {
            self.fill_crossed(book, symbol, close);
        }
    }
}

fn crosses(request: &OrderRequest, price: Price) -> bool {
    match (request.order_type, request.limit_price) {
        (OrderType::Market, _) => true,
        (OrderType::Limit, Some(limit)) => match request.side {
            Side::Buy => price <= limit,
            Side::Sell => price >= limit,
        },
        (OrderType::Limit, None) => false,
    }
}

fn base_quantity(request: &OrderRequest, price: Price) -> Quantity {
    match request.size {
        OrderSize::Base(qty) => qty,
        OrderSize::Quote(quote) => {
            (quote / price).round_dp_with_strategy(8, RoundingStrategy::ToZero)
        }
    }
}

#[async_trait]
impl VenueApi for PaperVenue {
    fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.check_fault(PaperOp::Connect)?;
        info!("[PAPER] {} connected", self.exchange);
        Ok(())
    }

    async fn balances(&self, nonces: &NonceIssuer) -> BrokerResult<Balances> {
        self.privileged(PaperOp::Balances, nonces, |book| Ok(book.assets.clone()))
            .await
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        _timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        self.check_fault(PaperOp::Candles)?;
        let mut book = self.book.lock();
        self.next_synthetic_bar(&mut book, symbol);
        let candles = book.candles.get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(count);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        reference_price: Price,
        nonces: &NonceIssuer,
    ) -> BrokerResult<OrderHandle> {
        self.privileged(PaperOp::Place, nonces, |book| {
            if request.symbol.base() == request.symbol.quote() {
                return Err(BrokerError::InvalidRequest(format!("bad pair {}", request.symbol)));
            }
            let price = book
                .prices
                .get(&request.symbol)
                .copied()
                .unwrap_or(reference_price);
            let qty = base_quantity(request, price);
            let notional = qty * price;
            let fee = notional * self.config.fee_pct / Decimal::ONE_HUNDRED;
            let has_funds = match request.side {
                Side::Buy => book.assets.get(request.symbol.quote()) >= notional + fee,
                Side::Sell => book.assets.get(request.symbol.base()) >= qty,
            };
            if !has_funds {
                return Err(BrokerError::InsufficientFunds(format!(
                    "{} {} {} needs more balance",
                    request.side, qty, request.symbol
                )));
            }

            let order_id = format!("PAPER-{}", book.next_order_id);
            book.next_order_id += 1;
            book.prices.entry(request.symbol.clone()).or_insert(price);
            let handle = OrderHandle {
                order_id: order_id.clone(),
                client_order_id: request.client_order_id,
                symbol: request.symbol.clone(),
            };
            book.orders.insert(
                order_id.clone(),
                PaperOrder {
                    request: request.clone(),
                    report: ExecutionReport {
                        handle: handle.clone(),
                        side: request.side,
                        status: OrderStatus::Open,
                        filled_qty: Decimal::ZERO,
                        avg_price: None,
                        fee: Decimal::ZERO,
                    },
                },
            );
            if book.fill_mode == FillMode::Immediate && crosses(request, price) {
                self.execute(book, &order_id, price);
            }

            if std::mem::take(&mut book.lose_next_ack) {
                return Err(BrokerError::Timeout(format!(
                    "acknowledgement for {order_id} lost"
                )));
            }
            Ok(handle)
        })
        .await
    }

    async fn order_status(
        &self,
        handle: &OrderHandle,
        nonces: &NonceIssuer,
    ) -> BrokerResult<ExecutionReport> {
        self.privileged(PaperOp::Status, nonces, |book| {
            book.orders
                .get(&handle.order_id)
                .map(|o| o.report.clone())
                .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", handle.order_id)))
        })
        .await
    }

    async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
        nonces: &NonceIssuer,
    ) -> BrokerResult<Option<OrderHandle>> {
        self.privileged(PaperOp::Find, nonces, |book| {
            Ok(book
                .orders
                .values()
                .find(|o| {
                    o.request.client_order_id == client_order_id && &o.request.symbol == symbol
                })
                .map(|o| o.report.handle.clone()))
        })
        .await
    }

    async fn cancel_order(&self, handle: &OrderHandle, nonces: &NonceIssuer) -> BrokerResult<()> {
        self.privileged(PaperOp::Cancel, nonces, |book| {
            let order = book
                .orders
                .get_mut(&handle.order_id)
                .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", handle.order_id)))?;
            if order.report.status.is_terminal() {
                return Err(BrokerError::Rejected(format!(
                    "order {} already {:?}",
                    handle.order_id, order.report.status
                )));
            }
            order.report.status = OrderStatus::Canceled;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_clock::ManualClock;
    use meridian_nonce::{NonceConfig, SerializationAuthority};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<PaperVenue>, NonceIssuer) {
        let clock = ManualClock::starting_now();
        let authority = Arc::new(SerializationAuthority::new(
            clock.clone(),
            NonceConfig::default(),
        ));
        let venue = PaperVenue::new(
            ExchangeId::Kraken,
            PaperConfig {
                fee_pct: dec!(0.5),
                ..PaperConfig::default()
            },
            clock,
        );
        (venue, authority.nonces_for(ExchangeId::Kraken))
    }

    #[tokio::test]
    async fn test_market_buy_fills_and_charges_fee() {
        let (venue, nonces) = setup();
        let btc = Symbol::new("BTC", "USD");
        venue.set_price(&btc, dec!(50));

        let order = OrderRequest::market(btc.clone(), Side::Buy, OrderSize::Quote(dec!(100)));
        let handle = venue.place_order(&order, dec!(50), &nonces).await.unwrap();
        let report = venue.order_status(&handle, &nonces).await.unwrap();

        assert!(report.is_filled());
        assert_eq!(report.filled_qty, dec!(2));
        assert_eq!(report.fee, dec!(0.5));
        assert_eq!(venue.asset("BTC"), dec!(2));
        assert_eq!(venue.asset("USD"), dec!(899.5));
    }

    #[tokio::test]
    async fn test_rejects_stale_nonce() {
        let (venue, nonces) = setup();
        venue.balances(&nonces).await.unwrap();

        // A second authority seeded from the same clock reissues old values
        let clock = ManualClock::starting_now();
        let rogue = Arc::new(SerializationAuthority::new(
            clock,
            NonceConfig {
                safety_offset_secs: 0,
                ..NonceConfig::default()
            },
        ));
        let err = venue
            .balances(&rogue.nonces_for(ExchangeId::Kraken))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidNonce(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let (venue, nonces) = setup();
        let btc = Symbol::new("BTC", "USD");
        venue.set_price(&btc, dec!(50));
        let sell = OrderRequest::market(btc, Side::Sell, OrderSize::Base(dec!(1)));
        let err = venue.place_order(&sell, dec!(50), &nonces).await.unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn test_deferred_fill_and_cancel() {
        let (venue, nonces) = setup();
        let btc = Symbol::new("BTC", "USD");
        venue.set_price(&btc, dec!(50));
        venue.set_fill_mode(FillMode::Deferred);

        let a = OrderRequest::market(btc.clone(), Side::Buy, OrderSize::Quote(dec!(50)));
        let b = OrderRequest::market(btc.clone(), Side::Buy, OrderSize::Quote(dec!(50)));
        let ha = venue.place_order(&a, dec!(50), &nonces).await.unwrap();
        let hb = venue.place_order(&b, dec!(50), &nonces).await.unwrap();
        assert_eq!(
            venue.order_status(&ha, &nonces).await.unwrap().status,
            OrderStatus::Open
        );

        venue.cancel_order(&hb, &nonces).await.unwrap();
        venue.settle_open_orders();
        assert!(venue.order_status(&ha, &nonces).await.unwrap().is_filled());
        assert_eq!(
            venue.order_status(&hb, &nonces).await.unwrap().status,
            OrderStatus::Canceled
        );
        assert!(venue.cancel_order(&ha, &nonces).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let (venue, nonces) = setup();
        venue.inject_fault(PaperOp::Balances, BrokerError::RateLimited("429".into()));
        assert!(matches!(
            venue.balances(&nonces).await,
            Err(BrokerError::RateLimited(_))
        ));
        assert!(venue.balances(&nonces).await.is_ok());
        assert_eq!(venue.calls(PaperOp::Balances), 2);
    }

    #[tokio::test]
    async fn test_synthetic_feed_is_deterministic() {
        let make = || {
            PaperVenue::new(
                ExchangeId::Okx,
                PaperConfig {
                    synthetic_feed: Some(SyntheticFeed::default()),
                    ..PaperConfig::default()
                },
                ManualClock::starting_now(),
            )
        };
        let (a, b) = (make(), make());
        let eth = Symbol::new("ETH", "USDT");
        for _ in 0..5 {
            a.candles(&eth, Timeframe::FiveMinutes, 10).await.unwrap();
        }
        for _ in 0..4 {
            b.candles(&eth, Timeframe::FiveMinutes, 10).await.unwrap();
        }
        let last = b.candles(&eth, Timeframe::FiveMinutes, 10).await.unwrap();
        assert_eq!(last.len(), 5);
        assert_eq!(a.price(&eth), b.price(&eth));
        assert!(last.iter().all(|c| c.low <= c.close && c.close <= c.high));
    }
}
