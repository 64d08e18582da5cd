//! Meridian Runner - multi-account trading engine
//!
//! Wires the broker, exit and risk layers into one supervised loop per
//! account:
//!
//! - **Config**: JSON engine configuration with validation
//! - **Bootstrap**: account discovery, credential lookup and funding checks
//! - **Supervisor**: the per-account trading cycle
//! - **Engine**: task spawning, status channels and graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────┐
//!                    │   discover_accounts  │
//!                    └──────────┬───────────┘
//!                               │ funded accounts
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         TRADING ENGINE                           │
//! │                                                                  │
//! │  ┌────────────────────┐  ┌────────────────────┐                  │
//! │  │ Supervisor         │  │ Supervisor         │   ...            │
//! │  │ kraken:master      │  │ kraken:user:alice  │                  │
//! │  │ ExitEngine         │  │ ExitEngine         │                  │
//! │  │ RiskGovernor       │  │ RiskGovernor       │                  │
//! │  └─────────┬──────────┘  └─────────┬──────────┘                  │
//! │            │ status (watch), trades (broadcast)                  │
//! └────────────┼───────────────────────┼─────────────────────────────┘
//!              ▼                       ▼
//!       ┌─────────────────────────────────────┐
//!       │ BrokerAdapter ─► SerializationAuthority (one per process) │
//!       └─────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_runner::{discover_accounts, load_config, ExitOnlyStrategy, TradingEngine};
//!
//! let config = load_config("meridian.json")?;
//! let discovery = discover_accounts(&config, authority, &credentials, clock.clone()).await?;
//! let engine = TradingEngine::start(&config, discovery.funded, Arc::new(ExitOnlyStrategy), clock)?;
//! tokio::signal::ctrl_c().await?;
//! let finals = engine.shutdown().await;
//! ```

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod error;
pub mod status;
pub mod strategy;
pub mod supervisor;

// Re-export main types
pub use bootstrap::{Discovery, FundedAccount, discover_accounts, paper_config, check_account};
pub use config::{
    AccountEntry, EngineConfig, ExchangeSettings, PaperSettings, RetrySettings, RunMode,
    load_config, load_config_from_str,
};
pub use engine::TradingEngine;
pub use error::{ConfigError, EngineError};
pub use status::{AccountStatus, PositionStatus, TaskHealth};
pub use strategy::{ExitOnlyStrategy, Signal, Strategy, StrategyDecision, StrategyInput};
pub use supervisor::{AccountSupervisor, SupervisorSettings};
