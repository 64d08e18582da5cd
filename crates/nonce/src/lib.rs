//! Meridian Request Serialization Authority
//!
//! Exchanges that authenticate with nonces reject any request whose nonce is
//! not strictly greater than the last one they saw for the same key family.
//! Several accounts on the same exchange, each running its own task, would
//! violate that immediately if they minted nonces independently. The
//! authority is the single place nonces come from, and the single lock that
//! keeps at most one authenticated request in flight per exchange.
//!
//! ## Architecture
//!
//! ```text
//!  kraken:master task ──┐                      ┌───────────────────────────┐
//!                       │  with_exclusive_     │  SerializationAuthority   │
//!  kraken:user:a task ──┼──── access(kraken) ─►│                           │
//!                       │                      │  kraken  ─► ExchangeLedger│
//!  kraken:user:b task ──┘                      │             last: u64     │
//!                                              │             lock: Mutex   │
//!  coinbase:master task ──────────────────────►│  coinbase ─► ExchangeLedger│
//!                                              └───────────────────────────┘
//! ```
//!
//! - Nonces are microseconds since the epoch plus a safety offset, so a fast
//!   restart never reissues a value the exchange has already seen.
//! - `next_nonce` is lock-free: one atomic read-modify-write per call.
//! - `with_exclusive_access` is reentrant per task, so a caller already
//!   inside the section can run a nested venue call without deadlocking.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_nonce::{NonceConfig, SerializationAuthority};
//!
//! let authority = Arc::new(SerializationAuthority::new(clock, NonceConfig::default()));
//! let nonces = authority.nonces_for(ExchangeId::Kraken);
//!
//! let balance = authority
//!     .with_exclusive_access(ExchangeId::Kraken, || venue.balances(&nonces))
//!     .await?;
//! ```

mod authority;
mod config;

pub use authority::{LedgerSnapshot, NonceIssuer, SerializationAuthority};
pub use config::NonceConfig;
