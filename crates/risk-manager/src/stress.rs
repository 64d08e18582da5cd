//! Shock-and-recovery Monte Carlo
//!
//! Each path starts from unit equity, takes an immediate drawdown shock, then
//! replays trades bootstrapped (with replacement) from the account's own
//! recent outcomes at the candidate tier's trade size. A path is ruined if its
//! equity ever falls to the ruin level. The test passes when ruin is rare
//! enough and the median path ends above where the shock left it.
//!
//! Seeded `StdRng`: the same outcomes and limits always give the same verdict.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::parameters::StressLimits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub simulations: usize,
    pub ruin_probability: f64,
    /// Equity right after the shock, from a start of 1.0
    pub post_shock_equity: f64,
    pub median_final_equity: f64,
    pub passed: bool,
}

/// Run the simulation for trades of `trade_pct` percent of equity
///
/// No outcomes means nothing to resample, which fails the test.
pub fn run_stress_test(outcomes_pct: &[Decimal], trade_pct: Decimal, limits: &StressLimits) -> StressReport {
    let shock = pct_to_fraction(limits.shock_pct);
    let post_shock = (1.0 - shock).max(0.0);
    let ruin_level = 1.0 - pct_to_fraction(limits.ruin_drawdown_pct);
    let max_ruin = limits.max_ruin_probability.to_f64().unwrap_or(0.0);

    let returns: Vec<f64> = outcomes_pct.iter().map(|p| pct_to_fraction(*p)).collect();
    if returns.is_empty() || limits.simulations == 0 {
        return StressReport {
            simulations: 0,
            ruin_probability: 1.0,
            post_shock_equity: post_shock,
            median_final_equity: post_shock,
            passed: false,
        };
    }

    let trade_fraction = pct_to_fraction(trade_pct);
    let mut rng = StdRng::seed_from_u64(limits.seed);
    let mut finals = Vec::with_capacity(limits.simulations);
    let mut ruined = 0usize;

    for _ in 0..limits.simulations {
        let mut equity = post_shock;
        let mut is_ruined = equity <= ruin_level;
        for _ in 0..limits.horizon_trades {
            let r = returns[rng.gen_range(0..returns.len())];
            equity *= 1.0 + trade_fraction * r;
            if equity <= ruin_level {
                is_ruined = true;
            }
        }
        if is_ruined {
            ruined += 1;
        }
        finals.push(equity);
    }

    finals.sort_by(|a, b| a.total_cmp(b));
    let median = finals[finals.len() / 2];
    let ruin_probability = ruined as f64 / limits.simulations as f64;

    StressReport {
        simulations: limits.simulations,
        ruin_probability,
        post_shock_equity: post_shock,
        median_final_equity: median,
        passed: ruin_probability <= max_ruin && median > post_shock,
    }
}

fn pct_to_fraction(pct: Decimal) -> f64 {
    pct.to_f64().unwrap_or(0.0) / 100.0
}
