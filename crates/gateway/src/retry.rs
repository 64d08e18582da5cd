//! Bounded retry with exponential backoff and jitter

use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::error::{BrokerError, BrokerResult};

/// Retry and timeout settings for one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomly added or removed (0.3 = ±30 %)
    pub jitter_ratio: f64,
    /// Upper bound on every single attempt
    pub request_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ratio: 0.3,
            request_timeout_ms: 15_000,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts, for tests and paper runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ratio: 0.0,
            request_timeout_ms: 5_000,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `attempt`, with jitter applied
    pub fn backoff(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-ratio..=ratio);
        nominal.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent
    ///
    /// `op` receives the 1-based attempt number. Each attempt is bounded by
    /// the request timeout; hitting it counts as a transient failure.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> BrokerResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(self.request_timeout(), op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(format!(
                    "{} exceeded {}ms",
                    label, self.request_timeout_ms
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "[RETRY] {} attempt {}/{} failed: {} (retrying in {:?})",
                        label, attempt, max_attempts, err, delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
