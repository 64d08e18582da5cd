//! Consecutive-loss circuit breaker

use chrono::{DateTime, Duration, Utc};
use log::warn;

use crate::parameters::BreakerLimits;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    max_consecutive_losses: u32,
    cooldown: Duration,
    consecutive_losses: u32,
    tripped_until: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(limits: &BreakerLimits) -> Self {
        Self {
            max_consecutive_losses: limits.max_consecutive_losses.max(1),
            cooldown: Duration::minutes(limits.cooldown_minutes as i64),
            consecutive_losses: 0,
            tripped_until: None,
        }
    }

    /// Record one closed trade. Returns true when this loss trips the breaker.
    ///
    /// Tripping resets the loss count, so after the cooldown it takes a fresh
    /// run of losses to trip again.
    pub fn record(&mut self, is_loss: bool, now: DateTime<Utc>) -> bool {
        if !is_loss {
            self.consecutive_losses = 0;
            return false;
        }
        self.consecutive_losses += 1;
        if self.consecutive_losses < self.max_consecutive_losses {
            return false;
        }

        let until = now + self.cooldown;
        warn!(
            "[RISK] Circuit breaker tripped after {} consecutive losses, idle until {}",
            self.consecutive_losses, until
        );
        self.consecutive_losses = 0;
        self.tripped_until = Some(until);
        true
    }

    pub fn is_tripped(&self, now: DateTime<Utc>) -> bool {
        self.tripped_until.is_some_and(|until| now < until)
    }

    /// End of the active cooldown, if any
    pub fn tripped_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.tripped_until.filter(|until| now < *until)
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }
}
