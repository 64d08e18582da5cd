//! Concurrency properties of the serialization authority

use meridian_clock::{ManualClock, SystemClock};
use meridian_core::ExchangeId;
use meridian_nonce::{NonceConfig, SerializationAuthority};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

fn shared_authority() -> Arc<SerializationAuthority> {
    Arc::new(SerializationAuthority::new(
        Arc::new(SystemClock::new()),
        NonceConfig::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_nonces_strictly_increase_without_duplicates() {
    let _ = env_logger::builder().is_test(true).try_init();
    let authority = shared_authority();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let authority = Arc::clone(&authority);
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::with_capacity(500);
            for _ in 0..500 {
                seen.push(authority.next_nonce(ExchangeId::Kraken));
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let seen = handle.await.unwrap();
        // Each caller observes its own nonces strictly increasing
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        all.extend(seen);
    }

    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), 16 * 500);
    assert_eq!(authority.snapshot(ExchangeId::Kraken).issued, 16 * 500);
    assert_eq!(
        authority.snapshot(ExchangeId::Kraken).last_issued,
        *all.iter().max().unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_exclusive_sections_never_overlap() {
    let authority = shared_authority();
    // Non-atomic read-modify-write split across an await point
    let counter = Arc::new(SplitCounter::default());
    let in_flight = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let authority = Arc::clone(&authority);
        let counter = Arc::clone(&counter);
        let in_flight = Arc::clone(&in_flight);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                authority
                    .with_exclusive_access(ExchangeId::Coinbase, || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(now, 1, "two requests in flight on one exchange");

                        let value = counter.get();
                        tokio::task::yield_now().await;
                        counter.set(value + 1);

                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(counter.get(), 12 * 50);
}

#[tokio::test]
async fn test_nested_acquisition_does_not_deadlock() {
    let authority = shared_authority();

    let result = timeout(Duration::from_secs(2), async {
        authority
            .with_exclusive_access(ExchangeId::Kraken, || async {
                let placed = authority.next_nonce(ExchangeId::Kraken);
                let confirmed = authority
                    .with_exclusive_access(ExchangeId::Kraken, || async {
                        authority.next_nonce(ExchangeId::Kraken)
                    })
                    .await;
                (placed, confirmed)
            })
            .await
    })
    .await;

    let (placed, confirmed) = result.expect("nested section deadlocked");
    assert!(confirmed > placed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_exchanges_do_not_block_each_other() {
    let authority = shared_authority();
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let holder = {
        let authority = Arc::clone(&authority);
        tokio::spawn(async move {
            authority
                .with_exclusive_access(ExchangeId::Kraken, || async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                })
                .await;
        })
    };

    entered_rx.await.unwrap();
    let other = timeout(
        Duration::from_secs(1),
        authority.with_exclusive_access(ExchangeId::Okx, || async { 7 }),
    )
    .await;
    assert_eq!(other.unwrap(), 7);

    // Same exchange waits for the holder
    let blocked = timeout(
        Duration::from_millis(100),
        authority.with_exclusive_access(ExchangeId::Kraken, || async {}),
    )
    .await;
    assert!(blocked.is_err());

    let _ = release_tx.send(());
    holder.await.unwrap();
}

#[tokio::test]
async fn test_rejection_inside_section_moves_every_later_nonce_past_floor() {
    let clock = ManualClock::starting_now();
    let authority = Arc::new(SerializationAuthority::new(
        clock.clone(),
        NonceConfig::default(),
    ));
    let nonces = authority.nonces_for(ExchangeId::Kraken);

    let (stale, floor, retried) = authority
        .with_exclusive_access(ExchangeId::Kraken, || async {
            let stale = nonces.next();
            let floor = nonces.reject();
            (stale, floor, nonces.next())
        })
        .await;

    assert!(floor >= stale + 60_000_000);
    assert!(retried > floor);
}

/// Read and write are separate lock acquisitions, so overlapping callers lose updates
#[derive(Default)]
struct SplitCounter(std::sync::Mutex<u64>);

impl SplitCounter {
    fn get(&self) -> u64 {
        *self.0.lock().unwrap()
    }

    fn set(&self, value: u64) {
        *self.0.lock().unwrap() = value;
    }
}
