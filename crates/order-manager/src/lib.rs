//! Meridian Order Manager
//!
//! Owns what an account holds and decides when to get out of it:
//! - **Positions**: entry price, remaining size, best price, fired rungs
//! - **Exit Engine**: fee-aware profit ladder, trailing stop, stop-loss and
//!   maximum hold, evaluated in that order
//! - **Pending Orders**: accepted-but-unconfirmed orders awaiting reconciliation
//!
//! ## Architecture
//!
//! ```text
//!   candles ──► mark_to_market ──► evaluate_all ──► ExitDecision ──► BrokerAdapter
//!                                                                        │
//!                 ┌──────────── Filled ◄──────────────────────────────────┤
//!                 ▼                                                       │
//!            commit_exit ──► TradeResult ──► RiskGovernor            Pending
//!                                                                        │
//!            resolve_pending_exit ◄── PendingOrders::resolve ◄── next cycle
//! ```
//!
//! The engine performs no I/O. Evaluation is read-only; state only changes
//! when a fill (or its absence) is committed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_order_manager::{ExitEngine, ExitRules, Fill};
//!
//! let mut engine = ExitEngine::new(account, ExitRules::default(), dec!(10))?;
//! engine.apply_entry(&symbol, PositionSide::Long, Fill::new(qty, price), now)?;
//!
//! engine.mark_to_market(&prices);
//! for decision in engine.evaluate_all(&prices, now) {
//!     // place the exit, then:
//!     engine.commit_exit(&decision, fill, now)?;
//! }
//! ```

pub mod engine;
pub mod error;
pub mod pending;
pub mod position;
pub mod rules;

// Re-export main types
pub use engine::{ExitDecision, ExitEngine, Fill, Reconciliation};
pub use error::{Error, Result};
pub use pending::{OrderIntent, PendingOrder, PendingOrders, Resolution, UnconfirmedOrder};
pub use position::{Position, PositionState};
pub use rules::{ExitRules, ProfitRung, TrailingRule};
