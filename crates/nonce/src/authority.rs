use dashmap::DashMap;
use log::{debug, warn};
use meridian_clock::Clock;
use meridian_core::ExchangeId;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::NonceConfig;

tokio::task_local! {
    /// Exchanges whose exclusive section the current task is already inside
    static HELD: HashSet<ExchangeId>;
}

/// Per-exchange ledger: last issued nonce plus the request lock
struct ExchangeLedger {
    last: AtomicU64,
    lock: Mutex<()>,
    issued: AtomicU64,
    rejections: AtomicU64,
}

impl ExchangeLedger {
    fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
            lock: Mutex::new(()),
            issued: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }
}

/// Point-in-time view of one exchange's ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub last_issued: u64,
    pub issued: u64,
    pub rejections: u64,
}

/// Process-wide nonce ledger and per-exchange request lock
///
/// Built once at startup and shared as `Arc` with every adapter.
pub struct SerializationAuthority {
    clock: Arc<dyn Clock>,
    config: NonceConfig,
    ledgers: DashMap<ExchangeId, Arc<ExchangeLedger>>,
}

impl SerializationAuthority {
    pub fn new(clock: Arc<dyn Clock>, config: NonceConfig) -> Self {
        Self {
            clock,
            config,
            ledgers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &NonceConfig {
        &self.config
    }

    fn ledger(&self, exchange: ExchangeId) -> Arc<ExchangeLedger> {
        if let Some(ledger) = self.ledgers.get(&exchange) {
            return ledger.value().clone();
        }
        self.ledgers
            .entry(exchange)
            .or_insert_with(|| Arc::new(ExchangeLedger::new()))
            .value()
            .clone()
    }

    fn floor_us(&self) -> u64 {
        self.clock
            .now_micros()
            .saturating_add(self.config.safety_offset_us())
    }

    /// Issue the next nonce for `exchange`
    ///
    /// Strictly greater than every value previously issued for the same
    /// exchange, from any account or thread.
    pub fn next_nonce(&self, exchange: ExchangeId) -> u64 {
        let ledger = self.ledger(exchange);
        let floor = self.floor_us();
        let step = |last: u64| last.saturating_add(1).max(floor);

        // The closure never returns None, so both arms carry the previous value.
        let prev = match ledger
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(step(last)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        ledger.issued.fetch_add(1, Ordering::Relaxed);
        step(prev)
    }

    /// The exchange rejected a nonce as stale: jump the ledger forward
    ///
    /// Returns the new floor. Every nonce issued afterwards exceeds it.
    pub fn record_rejection(&self, exchange: ExchangeId) -> u64 {
        let ledger = self.ledger(exchange);
        let floor = self.floor_us();
        let jump = self.config.recovery_jump_us();
        let bump = |last: u64| last.max(floor).saturating_add(jump);

        let prev = match ledger
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(bump(last)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        let rejections = ledger.rejections.fetch_add(1, Ordering::Relaxed) + 1;
        let new_floor = bump(prev);

        warn!(
            "[NONCE] {} rejected a nonce (#{}), ledger jumped {} -> {}",
            exchange, rejections, prev, new_floor
        );
        new_floor
    }

    /// Run `f` while holding `exchange`'s request lock
    ///
    /// At most one such section is active per exchange across the process.
    /// Reentrant per task: if the current task already holds `exchange`, `f`
    /// runs immediately. Holding one exchange and entering another nests
    /// normally. Reentrancy does not cross `tokio::spawn`, and futures joined
    /// concurrently inside a section share it, so requests inside a section
    /// should be issued sequentially.
    pub async fn with_exclusive_access<F, Fut, T>(&self, exchange: ExchangeId, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let already_held = HELD
            .try_with(|held| held.contains(&exchange))
            .unwrap_or(false);
        if already_held {
            return f().await;
        }

        let ledger = self.ledger(exchange);
        let _guard = ledger.lock.lock().await;
        debug!("[NONCE] acquired {}", exchange);

        let mut held = HELD.try_with(|held| held.clone()).unwrap_or_default();
        held.insert(exchange);
        let out = HELD.scope(held, f()).await;

        debug!("[NONCE] released {}", exchange);
        out
    }

    /// Whether the current task is inside `exchange`'s exclusive section
    pub fn holds(&self, exchange: ExchangeId) -> bool {
        HELD.try_with(|held| held.contains(&exchange))
            .unwrap_or(false)
    }

    /// Issuer handle for venue clients
    pub fn nonces_for(self: &Arc<Self>, exchange: ExchangeId) -> NonceIssuer {
        NonceIssuer {
            authority: Arc::clone(self),
            exchange,
        }
    }

    pub fn snapshot(&self, exchange: ExchangeId) -> LedgerSnapshot {
        match self.ledgers.get(&exchange) {
            Some(ledger) => LedgerSnapshot {
                last_issued: ledger.last.load(Ordering::SeqCst),
                issued: ledger.issued.load(Ordering::Relaxed),
                rejections: ledger.rejections.load(Ordering::Relaxed),
            },
            None => LedgerSnapshot::default(),
        }
    }
}

/// Draws nonces for one exchange
///
/// Handed to venue methods so a privileged call that needs several requests
/// can take several nonces inside one critical section.
#[derive(Clone)]
pub struct NonceIssuer {
    authority: Arc<SerializationAuthority>,
    exchange: ExchangeId,
}

impl NonceIssuer {
    pub fn next(&self) -> u64 {
        self.authority.next_nonce(self.exchange)
    }

    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    /// Jump the ledger after the exchange rejected a nonce
    pub fn reject(&self) -> u64 {
        self.authority.record_rejection(self.exchange)
    }
}

impl std::fmt::Debug for NonceIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceIssuer")
            .field("exchange", &self.exchange)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use meridian_clock::ManualClock;

    fn authority() -> (Arc<ManualClock>, SerializationAuthority) {
        let clock = ManualClock::starting_now();
        let authority = SerializationAuthority::new(clock.clone(), NonceConfig::default());
        (clock, authority)
    }

    #[test]
    fn test_seeded_from_clock_plus_offset() {
        let (clock, authority) = authority();
        let nonce = authority.next_nonce(ExchangeId::Kraken);
        assert_eq!(nonce, clock.now_micros() + 30_000_000);
    }

    #[test]
    fn test_frozen_clock_still_increases() {
        let (_clock, authority) = authority();
        let a = authority.next_nonce(ExchangeId::Kraken);
        let b = authority.next_nonce(ExchangeId::Kraken);
        let c = authority.next_nonce(ExchangeId::Kraken);
        assert_eq!(b, a + 1);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn test_clock_stepping_back_does_not_regress() {
        let (clock, authority) = authority();
        let a = authority.next_nonce(ExchangeId::Kraken);
        clock.advance(Duration::minutes(-10));
        let b = authority.next_nonce(ExchangeId::Kraken);
        assert!(b > a);
    }

    #[test]
    fn test_exchanges_are_independent() {
        let (_clock, authority) = authority();
        let k1 = authority.next_nonce(ExchangeId::Kraken);
        let _ = authority.next_nonce(ExchangeId::Kraken);
        let c1 = authority.next_nonce(ExchangeId::Coinbase);
        assert_eq!(c1, k1);
        assert_eq!(authority.snapshot(ExchangeId::Kraken).issued, 2);
        assert_eq!(authority.snapshot(ExchangeId::Coinbase).issued, 1);
        assert_eq!(authority.snapshot(ExchangeId::Okx), LedgerSnapshot::default());
    }

    #[test]
    fn test_rejection_jumps_ledger() {
        let (clock, authority) = authority();
        let before = authority.next_nonce(ExchangeId::Kraken);
        let floor = authority.record_rejection(ExchangeId::Kraken);
        assert_eq!(floor, before + 60_000_000);
        assert_eq!(floor, clock.now_micros() + 90_000_000);

        let after = authority.next_nonce(ExchangeId::Kraken);
        assert_eq!(after, floor + 1);
        assert_eq!(authority.snapshot(ExchangeId::Kraken).rejections, 1);
    }

    #[test]
    fn test_issuer_draws_from_shared_ledger() {
        let clock = ManualClock::starting_now();
        let authority = Arc::new(SerializationAuthority::new(clock, NonceConfig::default()));
        let issuer = authority.nonces_for(ExchangeId::Binance);
        let a = issuer.next();
        let b = authority.next_nonce(ExchangeId::Binance);
        let c = issuer.next();
        assert!(a < b && b < c);
        assert_eq!(issuer.exchange(), ExchangeId::Binance);
    }

    #[tokio::test]
    async fn test_holds_only_inside_section() {
        let (_clock, authority) = authority();
        assert!(!authority.holds(ExchangeId::Kraken));
        let inside = authority
            .with_exclusive_access(ExchangeId::Kraken, || async {
                (
                    authority.holds(ExchangeId::Kraken),
                    authority.holds(ExchangeId::Coinbase),
                )
            })
            .await;
        assert_eq!(inside, (true, false));
        assert!(!authority.holds(ExchangeId::Kraken));
    }
}
