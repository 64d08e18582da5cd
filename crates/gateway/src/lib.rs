//! Meridian Gateway
//!
//! Broker connection layer. Provides:
//! - Venue clients for Kraken, Coinbase, Binance and OKX, plus an in-process
//!   paper exchange
//! - Typed, pre-classified broker errors
//! - Bounded retry with exponential backoff and jitter
//! - Pre-flight order validation and symbol translation
//! - [`BrokerAdapter`], the per-account entry point used by the trading loop
//!
//! ## Architecture
//!
//! ```text
//!   AccountSupervisor
//!         │
//!   ┌─────▼─────────┐   with_exclusive_access   ┌────────────────────────┐
//!   │ BrokerAdapter │──────────────────────────►│ SerializationAuthority │
//!   │ retry/cache/  │◄──────── nonces ──────────│ (one per process)      │
//!   │ validation    │                           └────────────────────────┘
//!   └─────┬─────────┘
//!         │ match Venue
//!   ┌─────▼──────┬──────────┬──────────┬──────────┬──────────┐
//!   │   Kraken   │ Coinbase │ Binance  │   OKX    │  Paper   │
//!   └────────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_gateway::{BrokerAdapter, ExchangeRules, Venue, VenueConfig};
//!
//! let venue = Venue::live(ExchangeId::Kraken, VenueConfig { credentials, ..Default::default() })?;
//! let broker = BrokerAdapter::new(account, venue, authority, rules, clock);
//! broker.connect().await?;
//! let balance = broker.get_balance().await?;
//! ```

pub mod adapters;
pub mod broker;
pub mod credentials;
pub mod error;
pub mod retry;
pub mod symbols;
pub mod validation;

// Re-export commonly used types
pub use adapters::{
    Balances, FillMode, PaperConfig, PaperNonceGate, PaperOp, PaperVenue, SyntheticFeed, Venue,
    VenueApi, VenueConfig,
};
pub use broker::{Balance, BrokerAdapter, Execution, VerifyPolicy};
pub use credentials::{CredentialStore, Credentials, EnvCredentialStore};
pub use error::{BrokerError, BrokerResult, ErrorClass};
pub use retry::RetryPolicy;
pub use validation::ExchangeRules;
