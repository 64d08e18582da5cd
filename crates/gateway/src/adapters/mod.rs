//! Exchange venue clients
//!
//! Each venue speaks one exchange's REST dialect (or simulates one, for
//! paper trading) and maps raw responses into canonical types and typed
//! [`BrokerError`]s. Venues know nothing about retries, locking or caching;
//! the [`BrokerAdapter`](crate::BrokerAdapter) layers those on top.

mod binance;
mod coinbase;
mod http;
mod kraken;
mod okx;
pub mod paper;

pub use binance::BinanceClient;
pub use coinbase::CoinbaseClient;
pub use kraken::KrakenClient;
pub use okx::OkxClient;
pub use paper::{FillMode, PaperConfig, PaperNonceGate, PaperOp, PaperVenue, SyntheticFeed};

use async_trait::async_trait;
use meridian_core::{
    Candle, ExchangeId, ExecutionReport, OrderHandle, OrderRequest, Price, Symbol, Timeframe,
};
use meridian_nonce::NonceIssuer;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::error::BrokerResult;

/// Asset balances as reported by the exchange, keyed by canonical asset code
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Balances {
    pub assets: BTreeMap<String, Decimal>,
}

impl Balances {
    pub fn get(&self, asset: &str) -> Decimal {
        self.assets.get(asset).copied().unwrap_or_default()
    }

    pub fn add(&mut self, asset: impl Into<String>, amount: Decimal) {
        *self.assets.entry(asset.into()).or_default() += amount;
    }
}

/// Connection settings for a REST venue
#[derive(Debug, Clone, Default)]
pub struct VenueConfig {
    /// Override of the production endpoint (testnets, local mocks)
    pub base_url: Option<String>,
    pub credentials: Option<Credentials>,
}

/// What every exchange client can do
///
/// Privileged methods take the exchange's [`NonceIssuer`] and are only called
/// from inside the serialization authority's exclusive section.
#[async_trait]
pub trait VenueApi: Send + Sync {
    fn exchange(&self) -> ExchangeId;

    /// Reachability check against a public endpoint
    async fn connect(&self) -> BrokerResult<()>;

    async fn balances(&self, nonces: &NonceIssuer) -> BrokerResult<Balances>;

    /// Most recent `count` closed-or-forming candles, oldest first
    async fn candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>>;

    /// Submit an order. `reference_price` converts quote-sized orders for
    /// exchanges that only accept base quantities.
    async fn place_order(
        &self,
        request: &OrderRequest,
        reference_price: Price,
        nonces: &NonceIssuer,
    ) -> BrokerResult<OrderHandle>;

    async fn order_status(
        &self,
        handle: &OrderHandle,
        nonces: &NonceIssuer,
    ) -> BrokerResult<ExecutionReport>;

    /// Look an order up by the client id it was submitted with
    async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
        nonces: &NonceIssuer,
    ) -> BrokerResult<Option<OrderHandle>>;

    async fn cancel_order(&self, handle: &OrderHandle, nonces: &NonceIssuer) -> BrokerResult<()>;
}

/// The closed set of venues, chosen once per account
pub enum Venue {
    Kraken(KrakenClient),
    Coinbase(CoinbaseClient),
    Binance(BinanceClient),
    Okx(OkxClient),
    Paper(Arc<PaperVenue>),
}

impl Venue {
    /// Live REST client for `exchange`
    pub fn live(exchange: ExchangeId, config: VenueConfig) -> BrokerResult<Self> {
        Ok(match exchange {
            ExchangeId::Kraken => Venue::Kraken(KrakenClient::new(config)?),
            ExchangeId::Coinbase => Venue::Coinbase(CoinbaseClient::new(config)?),
            ExchangeId::Binance => Venue::Binance(BinanceClient::new(config)?),
            ExchangeId::Okx => Venue::Okx(OkxClient::new(config)?),
        })
    }

    pub fn paper(venue: Arc<PaperVenue>) -> Self {
        Venue::Paper(venue)
    }

    pub fn is_paper(&self) -> bool {
        matches!(self, Venue::Paper(_))
    }

    fn api(&self) -> &dyn VenueApi {
        match self {
            Venue::Kraken(client) => client,
            Venue::Coinbase(client) => client,
            Venue::Binance(client) => client,
            Venue::Okx(client) => client,
            Venue::Paper(paper) => paper.as_ref(),
        }
    }
}

#[async_trait]
impl VenueApi for Venue {
    fn exchange(&self) -> ExchangeId {
        self.api().exchange()
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.api().connect().await
    }

    async fn balances(&self, nonces: &NonceIssuer) -> BrokerResult<Balances> {
        self.api().balances(nonces).await
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        self.api().candles(symbol, timeframe, count).await
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        reference_price: Price,
        nonces: &NonceIssuer,
    ) -> BrokerResult<OrderHandle> {
        self.api()
            .place_order(request, reference_price, nonces)
            .await
    }

    async fn order_status(
        &self,
        handle: &OrderHandle,
        nonces: &NonceIssuer,
    ) -> BrokerResult<ExecutionReport> {
        self.api().order_status(handle, nonces).await
    }

    async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
        nonces: &NonceIssuer,
    ) -> BrokerResult<Option<OrderHandle>> {
        self.api().find_order(symbol, client_order_id, nonces).await
    }

    async fn cancel_order(&self, handle: &OrderHandle, nonces: &NonceIssuer) -> BrokerResult<()> {
        self.api().cancel_order(handle, nonces).await
    }
}
