//! Meridian Clock Infrastructure
//!
//! Every component that reads time does so through the [`Clock`] port so that
//! nonce seeding, position hold times and circuit-breaker cooldowns can be
//! driven deterministically in tests.
//!
//! ```text
//! Clock (port)
//!     ├── SystemClock  (wall time, production)
//!     └── ManualClock  (frozen until advanced, tests / paper replay)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use meridian_clock::{Clock, ManualClock};
//! use chrono::Duration;
//!
//! let clock = ManualClock::starting_now();
//! let t0 = clock.now();
//! clock.advance(Duration::minutes(5));
//! assert_eq!(clock.now() - t0, Duration::minutes(5));
//! ```

mod manual;
mod system;

pub use manual::ManualClock;
pub use system::SystemClock;

use meridian_core::Timestamp;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Get the current time according to this clock
    fn now(&self) -> Timestamp;

    /// Microseconds since the Unix epoch, clamped at zero
    fn now_micros(&self) -> u64 {
        u64::try_from(self.now().timestamp_micros()).unwrap_or(0)
    }

    /// Get the clock's name/identifier for debugging
    fn name(&self) -> &str {
        "Clock"
    }
}
