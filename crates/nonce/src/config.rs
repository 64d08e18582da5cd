use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Nonce ledger tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Added to wall time when seeding, so a restart stays ahead of any nonce
    /// issued by the previous process
    pub safety_offset_secs: u64,
    /// How far the ledger jumps after the exchange reports an invalid nonce
    pub recovery_jump_secs: u64,
}

impl NonceConfig {
    pub fn safety_offset(&self) -> Duration {
        Duration::from_secs(self.safety_offset_secs)
    }

    pub fn recovery_jump(&self) -> Duration {
        Duration::from_secs(self.recovery_jump_secs)
    }

    pub(crate) fn safety_offset_us(&self) -> u64 {
        self.safety_offset_secs.saturating_mul(1_000_000)
    }

    pub(crate) fn recovery_jump_us(&self) -> u64 {
        self.recovery_jump_secs.saturating_mul(1_000_000)
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            safety_offset_secs: 30,
            recovery_jump_secs: 60,
        }
    }
}
