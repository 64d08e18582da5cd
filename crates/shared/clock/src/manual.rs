use chrono::{Duration, Utc};
use meridian_core::Timestamp;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::Clock;

/// Clock that only moves when told to
///
/// Used by tests and paper runs that need exact control over hold durations,
/// cooldowns and nonce seeding.
pub struct ManualClock {
    current: RwLock<Timestamp>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(start),
        })
    }

    /// Create a clock frozen at the current wall time
    pub fn starting_now() -> Arc<Self> {
        Self::new(Utc::now())
    }

    /// Advance the clock by `duration`
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.write();
        *current += duration;
    }

    /// Explicitly set the time. Moving backwards is allowed, which lets tests
    /// simulate a host clock step.
    pub fn set(&self, time: Timestamp) {
        *self.current.write() = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.read()
    }

    fn name(&self) -> &str {
        "ManualClock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frozen_until_advanced() {
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now() - t0, Duration::seconds(90));
    }

    #[test]
    fn test_set_can_step_backwards() {
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        clock.set(t0 - Duration::hours(1));
        assert!(clock.now() < t0);
        assert_eq!(clock.now_micros() + 3_600_000_000, t0.timestamp_micros() as u64);
    }
}
