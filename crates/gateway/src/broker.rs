//! Per-account broker adapter
//!
//! Wraps one [`Venue`] with everything the venue itself does not do: request
//! serialization through the shared authority, bounded retries, pre-flight
//! validation, balance caching and place-then-confirm.

use log::{debug, info, warn};
use meridian_clock::Clock;
use meridian_core::{
    AccountId, Candle, ExchangeId, OrderHandle, OrderRequest, Price, Symbol, Timeframe,
    Timestamp, ExecutionReport,
};
use meridian_nonce::{NonceIssuer, SerializationAuthority};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::adapters::{Balances, Venue, VenueApi};
use crate::error::{BrokerError, BrokerResult};
use crate::retry::RetryPolicy;
use crate::validation::ExchangeRules;

/// How long to wait for a freshly accepted order to fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyPolicy {
    pub window_ms: u64,
    /// Status queries spread across the window
    pub polls: u32,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            window_ms: 2_000,
            polls: 4,
        }
    }
}

impl VerifyPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn interval(&self) -> Duration {
        self.window() / self.polls.max(1)
    }
}

/// Account balance as seen by the trading loop
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    /// Sum of the supported quote currencies
    pub cash: Decimal,
    /// Non-quote assets with a positive balance
    pub holdings: BTreeMap<String, Decimal>,
    pub as_of: Timestamp,
    /// True when this is a cached reading returned after a failed refresh
    pub stale: bool,
}

impl Balance {
    pub fn holding(&self, asset: &str) -> Decimal {
        self.holdings.get(asset).copied().unwrap_or_default()
    }
}

/// Outcome of an accepted order
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The order has fills. A report with a terminal non-filled status
    /// (canceled after a partial fill) also lands here.
    Filled(ExecutionReport),
    /// Accepted but not confirmed within the verification window
    Pending(OrderHandle),
}

/// Broker connection for one (exchange, account) pair
pub struct BrokerAdapter {
    account: AccountId,
    venue: Venue,
    authority: Arc<SerializationAuthority>,
    nonces: NonceIssuer,
    rules: ExchangeRules,
    retry: RetryPolicy,
    verify: VerifyPolicy,
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
    last_balance: Mutex<Option<Balance>>,
}

impl BrokerAdapter {
    pub fn new(
        account: AccountId,
        venue: Venue,
        authority: Arc<SerializationAuthority>,
        rules: ExchangeRules,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let nonces = authority.nonces_for(account.exchange);
        Self {
            account,
            venue,
            authority,
            nonces,
            rules,
            retry: RetryPolicy::default(),
            verify: VerifyPolicy::default(),
            clock,
            connected: AtomicBool::new(false),
            last_balance: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verify(mut self, verify: VerifyPolicy) -> Self {
        self.verify = verify;
        self
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn exchange(&self) -> ExchangeId {
        self.account.exchange
    }

    pub fn rules(&self) -> &ExchangeRules {
        &self.rules
    }

    pub fn is_paper(&self) -> bool {
        self.venue.is_paper()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last successful balance reading, if any
    pub fn cached_balance(&self) -> Option<Balance> {
        self.last_balance.lock().clone()
    }

    /// Reach the exchange, retrying transient failures
    pub async fn connect(&self) -> BrokerResult<()> {
        let label = format!("{} connect", self.account);
        let result = self.retry.run(&label, |_| self.venue.connect()).await;
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        match &result {
            Ok(()) => info!("[BROKER] {} connected", self.account),
            Err(err) => warn!("[BROKER] {} could not connect: {}", self.account, err),
        }
        result
    }

    /// Current balance
    ///
    /// A transient failure that outlasts the retries falls back to the last
    /// good reading, marked stale. Without one the error surfaces, as do
    /// permanent errors.
    pub async fn get_balance(&self) -> BrokerResult<Balance> {
        let label = format!("{} balance", self.account);
        let result = self
            .retry
            .run(&label, |_| self.exclusive(self.venue.balances(&self.nonces)))
            .await;
        self.observe(&result);

        match result {
            Ok(raw) => {
                let balance = self.summarize(raw);
                *self.last_balance.lock() = Some(balance.clone());
                Ok(balance)
            }
            Err(err) if err.is_transient() => {
                let cached = self.last_balance.lock().clone();
                match cached {
                    Some(mut balance) => {
                        warn!(
                            "[BROKER] {} balance refresh failed ({}), using reading from {}",
                            self.account, err, balance.as_of
                        );
                        balance.stale = true;
                        Ok(balance)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Public market data; does not take the exchange lock
    pub async fn get_candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        if !self.rules.supports_quote(symbol.quote()) {
            return Err(BrokerError::UnsupportedPair {
                symbol: symbol.clone(),
                exchange: self.exchange(),
            });
        }
        let label = format!("{} candles {}", self.account, symbol);
        let result = self
            .retry
            .run(&label, |_| self.venue.candles(symbol, timeframe, count))
            .await;
        self.observe(&result);
        result
    }

    /// Validate, submit and confirm an order
    ///
    /// Each signed request takes the exchange's exclusive section on its own;
    /// backoff and verification sleeps happen outside it, so other accounts
    /// on the exchange keep going. Retries reuse the request's client order
    /// id, and once an attempt may have reached the exchange the next one
    /// looks the order up before sending it again.
    ///
    /// An error for which [`BrokerError::is_ambiguous`] holds means the order
    /// may exist; the caller should look it up by client order id.
    pub async fn place_order(
        &self,
        request: &OrderRequest,
        reference_price: Price,
    ) -> BrokerResult<Execution> {
        self.rules.validate(request, reference_price)?;

        let result = match self.submit(request, reference_price).await {
            Ok(handle) => self.confirm(handle).await,
            Err(err) => Err(err),
        };
        self.observe(&result);

        match &result {
            Ok(Execution::Filled(report)) => info!(
                "[BROKER] {} {} {} filled {} @ {}",
                self.account,
                request.side,
                request.symbol,
                report.filled_qty,
                report.avg_price.unwrap_or_default()
            ),
            Ok(Execution::Pending(handle)) => warn!(
                "[BROKER] {} order {} accepted but unconfirmed, tracking as pending",
                self.account, handle.order_id
            ),
            Err(err) => warn!(
                "[BROKER] {} {} {} failed: {}",
                self.account, request.side, request.symbol, err
            ),
        }
        result
    }

    pub async fn order_status(&self, handle: &OrderHandle) -> BrokerResult<ExecutionReport> {
        let label = format!("{} status {}", self.account, handle.order_id);
        let result = self
            .retry
            .run(&label, |_| {
                self.exclusive(self.venue.order_status(handle, &self.nonces))
            })
            .await;
        self.observe(&result);
        result
    }

    pub async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
    ) -> BrokerResult<Option<OrderHandle>> {
        let label = format!("{} find {}", self.account, client_order_id);
        let result = self
            .retry
            .run(&label, |_| {
                self.exclusive(self.venue.find_order(symbol, client_order_id, &self.nonces))
            })
            .await;
        self.observe(&result);
        result
    }

    pub async fn cancel_order(&self, handle: &OrderHandle) -> BrokerResult<()> {
        let label = format!("{} cancel {}", self.account, handle.order_id);
        let result = self
            .retry
            .run(&label, |_| {
                self.exclusive(self.venue.cancel_order(handle, &self.nonces))
            })
            .await;
        self.observe(&result);
        if result.is_ok() {
            info!("[BROKER] {} canceled {}", self.account, handle.order_id);
        }
        result
    }

    async fn submit(&self, request: &OrderRequest, reference_price: Price) -> BrokerResult<OrderHandle> {
        let label = format!("{} place {} {}", self.account, request.side, request.symbol);
        let sent = AtomicBool::new(false);

        self.retry
            .run(&label, |attempt| {
                let sent = &sent;
                async move {
                    if attempt > 1 && sent.load(Ordering::SeqCst) {
                        let existing = self
                            .exclusive(self.venue.find_order(
                                &request.symbol,
                                request.client_order_id,
                                &self.nonces,
                            ))
                            .await?;
                        if let Some(handle) = existing {
                            info!(
                                "[BROKER] {} order {} already on the exchange, not resending",
                                self.account, handle.order_id
                            );
                            return Ok(handle);
                        }
                    }
                    sent.store(true, Ordering::SeqCst);
                    self.exclusive(self.venue.place_order(request, reference_price, &self.nonces))
                        .await
                        .map_err(BrokerError::after_submission)
                }
            })
            .await
    }

    async fn confirm(&self, handle: OrderHandle) -> BrokerResult<Execution> {
        let polls = self.verify.polls.max(1);
        for poll in 1..=polls {
            let status = timeout(
                self.retry.request_timeout(),
                self.exclusive(self.venue.order_status(&handle, &self.nonces)),
            )
            .await
            .unwrap_or_else(|_| {
                Err(BrokerError::Timeout(format!("status of {}", handle.order_id)))
            });

            match status {
                Ok(report) if report.is_filled() => return Ok(Execution::Filled(report)),
                Ok(report) if report.status.is_terminal() => {
                    if report.has_fills() {
                        return Ok(Execution::Filled(report));
                    }
                    return Err(BrokerError::Rejected(format!(
                        "order {} ended {:?} without fills",
                        handle.order_id, report.status
                    )));
                }
                Ok(report) => debug!(
                    "[BROKER] {} order {} still {:?} (poll {}/{})",
                    self.account, handle.order_id, report.status, poll, polls
                ),
                Err(err) if err.is_transient() => debug!(
                    "[BROKER] {} status poll {}/{} failed: {}",
                    self.account, poll, polls, err
                ),
                Err(err) => return Err(err),
            }

            if poll < polls {
                sleep(self.verify.interval()).await;
            }
        }
        Ok(Execution::Pending(handle))
    }

    /// Run a privileged venue call inside the exchange's exclusive section
    async fn exclusive<T, Fut>(&self, call: Fut) -> BrokerResult<T>
    where
        Fut: Future<Output = BrokerResult<T>>,
    {
        let exchange = self.exchange();
        let result = self
            .authority
            .with_exclusive_access(exchange, || call)
            .await;
        if let Err(BrokerError::InvalidNonce(_)) = &result {
            self.authority.record_rejection(exchange);
        }
        result
    }

    fn observe<T>(&self, result: &BrokerResult<T>) {
        if let Err(BrokerError::Connection(_) | BrokerError::NotConnected(_)) = result {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    fn summarize(&self, raw: Balances) -> Balance {
        let mut cash = Decimal::ZERO;
        let mut holdings = BTreeMap::new();
        for (asset, amount) in raw.assets {
            if self.rules.supports_quote(&asset) {
                cash += amount;
            } else if amount > Decimal::ZERO {
                holdings.insert(asset, amount);
            }
        }
        Balance {
            cash,
            holdings,
            as_of: self.clock.now(),
            stale: false,
        }
    }
}
