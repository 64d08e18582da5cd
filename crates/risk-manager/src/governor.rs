//! Risk Governor
//!
//! One per account. The supervisor feeds it equity and closed trades every
//! cycle and asks it to size (or veto) each prospective entry.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use meridian_core::{AccountId, Percent, Symbol, TradeResult};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

use crate::breaker::CircuitBreaker;
use crate::error::Result;
use crate::outcomes::{OutcomeWindow, PerformanceStats};
use crate::parameters::GovernorConfig;
use crate::stress::{StressReport, run_stress_test};
use crate::surveillance::{MarketConditions, TradingMode, select_mode};
use crate::throttle::{DrawdownTracker, ThrottleLevel};
use crate::tiers::{CapitalTier, tier_for_balance};

/// A prospective entry as the strategy proposes it
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: Symbol,
    /// `None` when the candle window was too short to measure
    pub conditions: Option<MarketConditions>,
    /// Share of equity the strategy would like to commit, in percent
    pub strategy_pct: Percent,
    /// Strategy's own setup quality, 0..1
    pub quality: Decimal,
    /// Free quote cash on the account
    pub cash: Decimal,
    pub open_positions: usize,
    pub min_order_notional: Decimal,
}

/// Why an entry was refused
#[derive(Debug, Clone, PartialEq)]
pub enum VetoReason {
    CircuitBreaker { until: DateTime<Utc> },
    DrawdownHalt { drawdown_pct: Decimal },
    MaxPositions { open: usize, max: usize },
    Idle { reason: String },
    LowQuality { quality: Decimal, required: Decimal },
    ReserveExhausted { cash: Decimal, reserve: Decimal },
    BelowMinimum { size: Decimal, minimum: Decimal },
}

impl fmt::Display for VetoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VetoReason::CircuitBreaker { until } => {
                write!(f, "circuit breaker cooling down until {}", until.format("%H:%M:%S UTC"))
            }
            VetoReason::DrawdownHalt { drawdown_pct } => {
                write!(f, "drawdown {:.2}% halts new entries", drawdown_pct)
            }
            VetoReason::MaxPositions { open, max } => {
                write!(f, "{open} open positions, limit is {max}")
            }
            VetoReason::Idle { reason } => write!(f, "IDLE: {reason}"),
            VetoReason::LowQuality { quality, required } => {
                write!(f, "setup quality {quality} below CAUTIOUS minimum {required}")
            }
            VetoReason::ReserveExhausted { cash, reserve } => {
                write!(f, "cash ${:.2} does not exceed reserve ${:.2}", cash, reserve)
            }
            VetoReason::BelowMinimum { size, minimum } => {
                write!(f, "order ${:.2} below exchange minimum ${:.2}", size, minimum)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Allowed { quote_size: Decimal, mode: TradingMode },
    Vetoed(VetoReason),
}

impl EntryDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, EntryDecision::Allowed { .. })
    }
}

/// What the status snapshot shows about risk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskSnapshot {
    pub mode: TradingMode,
    pub mode_reason: String,
    pub throttle: ThrottleLevel,
    pub drawdown_pct: Decimal,
    pub tier: String,
    pub max_trade_pct: Decimal,
    pub breaker_until: Option<DateTime<Utc>>,
    pub consecutive_losses: u32,
    pub samples: usize,
    pub win_rate: Decimal,
    pub last_veto: Option<String>,
}

pub struct RiskGovernor {
    account: AccountId,
    config: GovernorConfig,
    outcomes: OutcomeWindow,
    breaker: CircuitBreaker,
    drawdown: DrawdownTracker,
    equity: Decimal,
    /// Highest tier the account's performance has earned
    unlocked_tier: usize,
    /// Last stress verdict: (tier, outcomes recorded when run, report)
    stress_cache: Option<(usize, u64, StressReport)>,
    mode: TradingMode,
    mode_reason: String,
    last_veto: Option<String>,
}

impl RiskGovernor {
    pub fn new(account: AccountId, config: GovernorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            outcomes: OutcomeWindow::new(config.outcomes.window, config.outcomes.meaningful_win_pct),
            breaker: CircuitBreaker::new(&config.breaker),
            drawdown: DrawdownTracker::new(config.drawdown.clone()),
            equity: Decimal::ZERO,
            unlocked_tier: 0,
            stress_cache: None,
            mode: TradingMode::Idle,
            mode_reason: "no cycle yet".to_string(),
            last_veto: None,
            account,
            config,
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn equity(&self) -> Decimal {
        self.equity
    }

    /// Rolling win rate, once enough outcomes exist to trust it
    pub fn win_rate(&self) -> Option<Decimal> {
        (self.outcomes.len() >= self.config.outcomes.min_samples).then(|| self.outcomes.win_rate())
    }

    pub fn stats(&self) -> PerformanceStats {
        self.outcomes.stats(self.drawdown.max_drawdown_pct())
    }

    pub fn throttle(&self) -> ThrottleLevel {
        self.drawdown.level()
    }

    pub fn is_tripped(&self, now: DateTime<Utc>) -> bool {
        self.breaker.is_tripped(now)
    }

    /// Tier in force: the lower of what balance allows and what was unlocked
    pub fn effective_tier(&self) -> &CapitalTier {
        let by_balance = tier_for_balance(&self.config.tiers, self.equity);
        &self.config.tiers[by_balance.min(self.unlocked_tier)]
    }

    pub fn unlocked_tier(&self) -> &CapitalTier {
        &self.config.tiers[self.unlocked_tier]
    }

    /// Mode for the given market, remembered for the status snapshot
    ///
    /// A tripped circuit breaker forces IDLE until it resets.
    pub fn select_mode(
        &mut self,
        conditions: Option<&MarketConditions>,
        now: DateTime<Utc>,
    ) -> TradingMode {
        let (mode, reason) = match self.breaker.tripped_until(now) {
            Some(until) => (TradingMode::Idle, format!("circuit breaker until {until}")),
            None => select_mode(conditions, self.win_rate(), &self.config.mode),
        };
        if mode != self.mode {
            info!("[RISK] {} mode {} -> {} ({})", self.account, self.mode, mode, reason);
        }
        self.mode = mode;
        self.mode_reason = reason;
        mode
    }

    /// Size an entry or say why not
    pub fn assess_entry(&mut self, request: &EntryRequest, now: DateTime<Utc>) -> EntryDecision {
        let decision = self.decide_entry(request, now);
        match &decision {
            EntryDecision::Allowed { quote_size, mode } => {
                debug!(
                    "[RISK] {} entry {} allowed: ${} ({})",
                    self.account, request.symbol, quote_size, mode
                );
                self.last_veto = None;
            }
            EntryDecision::Vetoed(reason) => {
                debug!("[RISK] {} entry {} vetoed: {}", self.account, request.symbol, reason);
                self.last_veto = Some(format!("{}: {}", request.symbol, reason));
            }
        }
        decision
    }

    fn decide_entry(&mut self, request: &EntryRequest, now: DateTime<Utc>) -> EntryDecision {
        let mode = self.select_mode(request.conditions.as_ref(), now);
        if let Some(until) = self.breaker.tripped_until(now) {
            return EntryDecision::Vetoed(VetoReason::CircuitBreaker { until });
        }
        if self.drawdown.level() == ThrottleLevel::Halted {
            return EntryDecision::Vetoed(VetoReason::DrawdownHalt {
                drawdown_pct: self.drawdown.drawdown_pct(),
            });
        }
        if request.open_positions >= self.config.max_open_positions {
            return EntryDecision::Vetoed(VetoReason::MaxPositions {
                open: request.open_positions,
                max: self.config.max_open_positions,
            });
        }

        match mode {
            TradingMode::Idle => {
                return EntryDecision::Vetoed(VetoReason::Idle {
                    reason: self.mode_reason.clone(),
                });
            }
            TradingMode::Cautious if request.quality < self.config.mode.cautious_min_quality => {
                return EntryDecision::Vetoed(VetoReason::LowQuality {
                    quality: request.quality,
                    required: self.config.mode.cautious_min_quality,
                });
            }
            _ => {}
        }

        let tier_pct = self.effective_tier().max_trade_pct;
        let pct = request.strategy_pct.min(tier_pct);
        let wanted = self.equity * pct / Decimal::ONE_HUNDRED
            * mode.size_multiplier(&self.config.mode)
            * self.drawdown.level().size_multiplier();

        let reserve = self.equity * self.config.reserve_ratio;
        let spendable = request.cash - reserve;
        if spendable <= Decimal::ZERO {
            return EntryDecision::Vetoed(VetoReason::ReserveExhausted {
                cash: request.cash,
                reserve,
            });
        }

        let quote_size = wanted.min(spendable).round_dp(2);
        if quote_size < request.min_order_notional || quote_size <= Decimal::ZERO {
            return EntryDecision::Vetoed(VetoReason::BelowMinimum {
                size: quote_size,
                minimum: request.min_order_notional,
            });
        }
        EntryDecision::Allowed { quote_size, mode }
    }

    /// Fold a closed trade into the rolling stats and the breaker
    pub fn record_outcome(&mut self, result: &TradeResult, now: DateTime<Utc>) {
        self.outcomes.push(result.net_pnl_pct);
        if self.breaker.record(result.is_loss(), now) {
            warn!(
                "[RISK] {} idle until {} after losing trade on {}",
                self.account,
                now + chrono::Duration::minutes(self.config.breaker.cooldown_minutes as i64),
                result.symbol
            );
        }
        self.try_promote();
    }

    /// Record the account's latest equity; returns the throttle now in force
    pub fn update_equity(&mut self, equity: Decimal) -> ThrottleLevel {
        self.equity = equity;
        let level = self.drawdown.update(equity);

        let drawdown = self.drawdown.drawdown_pct();
        while self.unlocked_tier > 0 && drawdown > self.config.tiers[self.unlocked_tier].max_drawdown_pct {
            let from = self.config.tiers[self.unlocked_tier].name.clone();
            self.unlocked_tier -= 1;
            warn!(
                "[RISK] {} demoted {} -> {}: drawdown {:.2}%",
                self.account, from, self.config.tiers[self.unlocked_tier].name, drawdown
            );
        }

        self.try_promote();
        level
    }

    /// Advance the unlocked tier while balance, performance and (where
    /// required) the stress test all allow the next one
    fn try_promote(&mut self) {
        let by_balance = tier_for_balance(&self.config.tiers, self.equity);
        while self.unlocked_tier < by_balance {
            let target = self.unlocked_tier + 1;
            if self.outcomes.len() < self.config.outcomes.min_samples {
                return;
            }
            let stats = self.stats();
            let tier = &self.config.tiers[target];
            if !tier.performance_met(&stats) {
                return;
            }
            if tier.requires_stress_test && !self.stress_passes(target) {
                return;
            }
            self.unlocked_tier = target;
            info!(
                "[RISK] {} promoted to tier {} (max trade {}%, win rate {:.2}, profit factor {:.2})",
                self.account,
                self.config.tiers[target].name,
                self.config.tiers[target].max_trade_pct,
                stats.win_rate,
                stats.profit_factor
            );
        }
    }

    /// Cached per tier until a new outcome arrives
    fn stress_passes(&mut self, tier: usize) -> bool {
        let recorded = self.outcomes.total_recorded();
        if let Some((cached_tier, cached_at, report)) = &self.stress_cache {
            if *cached_tier == tier && *cached_at == recorded {
                return report.passed;
            }
        }

        let report = run_stress_test(
            &self.outcomes.values(),
            self.config.tiers[tier].max_trade_pct,
            &self.config.stress,
        );
        info!(
            "[RISK] {} stress test for tier {}: ruin {:.3}, median {:.3} vs {:.3} -> {}",
            self.account,
            self.config.tiers[tier].name,
            report.ruin_probability,
            report.median_final_equity,
            report.post_shock_equity,
            if report.passed { "pass" } else { "fail" }
        );
        let passed = report.passed;
        self.stress_cache = Some((tier, recorded, report));
        passed
    }

    pub fn last_stress_report(&self) -> Option<&StressReport> {
        self.stress_cache.as_ref().map(|(_, _, report)| report)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> RiskSnapshot {
        let tier = self.effective_tier();
        RiskSnapshot {
            mode: self.mode,
            mode_reason: self.mode_reason.clone(),
            throttle: self.drawdown.level(),
            drawdown_pct: self.drawdown.drawdown_pct(),
            tier: tier.name.clone(),
            max_trade_pct: tier.max_trade_pct,
            breaker_until: self.breaker.tripped_until(now),
            consecutive_losses: self.breaker.consecutive_losses(),
            samples: self.outcomes.len(),
            win_rate: self.outcomes.win_rate(),
            last_veto: self.last_veto.clone(),
        }
    }
}
