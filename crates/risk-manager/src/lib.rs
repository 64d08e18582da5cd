//! Meridian Risk Manager
//!
//! Decides whether an account may open a position and how large. Exits are
//! never gated here.
//!
//! - **Trading Mode**: AGGRESSIVE / CAUTIOUS / IDLE from volatility, trend
//!   strength, volume and the rolling meaningful-win rate
//! - **Circuit Breaker**: forced IDLE for a cooldown after a run of losses
//! - **Drawdown Throttle**: size steps down as equity falls from its peak
//! - **Capital Tiers**: balance and earned performance cap the trade size;
//!   larger tiers may also demand a passing stress simulation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Risk Governor                          │
//! │                                                             │
//! │  Candles ──────► Surveillance ──────► TradingMode          │
//! │                                                             │
//! │  Equity ───────► DrawdownTracker ───► ThrottleLevel        │
//! │                                                             │
//! │  TradeResult ──► OutcomeWindow ─┬───► CapitalTier          │
//! │                                 │        ▲                  │
//! │                                 │   stress test             │
//! │                                 └───► CircuitBreaker        │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!              EntryDecision (Allowed size | VetoReason)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_risk_manager::{EntryDecision, EntryRequest, GovernorConfig, RiskGovernor};
//!
//! let mut governor = RiskGovernor::new(account, GovernorConfig::default())?;
//! governor.update_equity(equity);
//!
//! match governor.assess_entry(&request, now) {
//!     EntryDecision::Allowed { quote_size, .. } => { /* place the entry */ }
//!     EntryDecision::Vetoed(reason) => log::info!("skipped: {reason}"),
//! }
//!
//! // after every closed position
//! governor.record_outcome(&trade_result, now);
//! ```

pub mod breaker;
pub mod error;
pub mod governor;
pub mod outcomes;
pub mod parameters;
pub mod stress;
pub mod surveillance;
pub mod throttle;
pub mod tiers;

// Re-export main types
pub use breaker::CircuitBreaker;
pub use error::{Result, RiskError};
pub use governor::{EntryDecision, EntryRequest, RiskGovernor, RiskSnapshot, VetoReason};
pub use outcomes::{OutcomeWindow, PerformanceStats};
pub use parameters::{
    BreakerLimits, DrawdownLimits, GovernorConfig, ModeThresholds, OutcomeLimits, StressLimits,
};
pub use stress::{StressReport, run_stress_test};
pub use surveillance::{MarketConditions, TradingMode, select_mode};
pub use throttle::{DrawdownTracker, ThrottleLevel};
pub use tiers::{CapitalTier, tier_for_balance};
