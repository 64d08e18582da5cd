use chrono::Utc;
use meridian_core::Timestamp;

use crate::Clock;

/// Wall-clock time; seeds live nonces
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }

    fn name(&self) -> &str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_track_wall_time() {
        let clock = SystemClock::new();
        let before = Utc::now().timestamp_micros() as u64;
        let micros = clock.now_micros();
        let after = Utc::now().timestamp_micros() as u64;
        assert!(before <= micros && micros <= after);
        assert_eq!(clock.name(), "system");
    }
}
