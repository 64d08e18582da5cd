//! Broker adapter behaviour against the paper exchange
//!
//! Covers retry bounds, stale balance fallback, duplicate-free placement,
//! pending orders and nonce serialization across accounts.

use meridian_clock::{Clock, ManualClock};
use meridian_core::{AccountId, ExchangeId, OrderRequest, OrderSize, OrderStatus, Side, Symbol};
use meridian_gateway::{
    BrokerAdapter, BrokerError, Execution, ExchangeRules, FillMode, PaperConfig, PaperNonceGate,
    PaperOp, PaperVenue, RetryPolicy, Venue, VerifyPolicy,
};
use meridian_nonce::{NonceConfig, SerializationAuthority};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    authority: Arc<SerializationAuthority>,
    clock: Arc<ManualClock>,
    gate: Arc<PaperNonceGate>,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::starting_now();
        Self {
            authority: Arc::new(SerializationAuthority::new(
                clock.clone(),
                NonceConfig::default(),
            )),
            clock,
            gate: PaperNonceGate::new(),
        }
    }

    fn account(&self, account: AccountId, config: PaperConfig) -> (BrokerAdapter, Arc<PaperVenue>) {
        let clock: Arc<dyn Clock> = self.clock.clone();
        let paper = PaperVenue::with_gate(account.exchange, config, clock.clone(), self.gate.clone());
        let broker = BrokerAdapter::new(
            account.clone(),
            Venue::paper(paper.clone()),
            self.authority.clone(),
            ExchangeRules::new(account.exchange, dec!(10)),
            clock,
        )
        .with_retry(RetryPolicy::immediate(3))
        .with_verify(VerifyPolicy {
            window_ms: 10,
            polls: 2,
        });
        (broker, paper)
    }

    fn master(&self) -> (BrokerAdapter, Arc<PaperVenue>) {
        self.account(AccountId::master(ExchangeId::Kraken), PaperConfig::default())
    }
}

fn btc() -> Symbol {
    Symbol::new("BTC", "USD")
}

fn buy(quote: rust_decimal::Decimal) -> OrderRequest {
    OrderRequest::market(btc(), Side::Buy, OrderSize::Quote(quote))
}

#[tokio::test]
async fn test_stale_balance_after_transient_failures() {
    let _ = env_logger::try_init();
    let harness = Harness::new();
    let (broker, paper) = harness.master();

    let fresh = broker.get_balance().await.unwrap();
    assert_eq!(fresh.cash, dec!(1000));
    assert!(!fresh.stale);

    paper.set_persistent_fault(Some(BrokerError::ServiceUnavailable("503".into())));
    let cached = broker.get_balance().await.unwrap();
    assert!(cached.stale);
    assert_eq!(cached.cash, dec!(1000));
    assert_eq!(cached.as_of, fresh.as_of);
}

#[tokio::test]
async fn test_transient_failure_without_cache_surfaces() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_persistent_fault(Some(BrokerError::Timeout("read".into())));

    let err = broker.get_balance().await.unwrap_err();
    assert!(matches!(err, BrokerError::Timeout(_)));
    assert!(broker.cached_balance().is_none());
}

#[tokio::test]
async fn test_retry_gives_up_after_bounded_attempts() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_persistent_fault(Some(BrokerError::RateLimited("429".into())));

    assert!(broker.get_balance().await.is_err());
    assert_eq!(paper.calls(PaperOp::Balances), 3);
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    broker.get_balance().await.unwrap();

    paper.inject_fault(
        PaperOp::Balances,
        BrokerError::Authentication("EAPI:Invalid key".into()),
    );
    let err = broker.get_balance().await.unwrap_err();
    assert!(matches!(err, BrokerError::Authentication(_)));
    // One successful call plus the single failed one
    assert_eq!(paper.calls(PaperOp::Balances), 2);
}

#[tokio::test]
async fn test_insufficient_funds_fails_immediately() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_price(&btc(), dec!(50));

    let err = broker.place_order(&buy(dec!(5000)), dec!(50)).await.unwrap_err();
    assert!(matches!(err, BrokerError::InsufficientFunds(_)));
    assert_eq!(paper.calls(PaperOp::Place), 1);
    assert_eq!(paper.orders_accepted(), 0);
}

#[tokio::test]
async fn test_lost_acknowledgement_does_not_duplicate_order() {
    let _ = env_logger::try_init();
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_price(&btc(), dec!(50));
    paper.lose_next_ack();

    let execution = broker.place_order(&buy(dec!(100)), dec!(50)).await.unwrap();

    let Execution::Filled(report) = execution else {
        panic!("expected a fill");
    };
    assert_eq!(report.filled_qty, dec!(2));
    assert_eq!(paper.orders_accepted(), 1);
    assert_eq!(paper.calls(PaperOp::Place), 1);
    assert_eq!(paper.calls(PaperOp::Find), 1);
    assert_eq!(paper.asset("BTC"), dec!(2));
}

#[tokio::test]
async fn test_unreadable_order_response_is_unverified() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_price(&btc(), dec!(50));
    paper.inject_fault(PaperOp::Place, BrokerError::Parse("expected value at line 1".into()));

    let err = broker.place_order(&buy(dec!(100)), dec!(50)).await.unwrap_err();
    assert!(matches!(err, BrokerError::Unverified(_)));
    assert!(err.is_ambiguous());
    // Not retried blindly; the caller resolves it by lookup
    assert_eq!(paper.calls(PaperOp::Place), 1);
}

#[tokio::test(start_paused = true)]
async fn test_verify_window_does_not_block_other_accounts() {
    let _ = env_logger::try_init();
    let harness = Harness::new();
    let (master, paper) = harness.master();
    let master = Arc::new(master.with_verify(VerifyPolicy {
        window_ms: 10_000,
        polls: 2,
    }));
    let (alice, _) = harness.account(
        AccountId::user(ExchangeId::Kraken, "alice"),
        PaperConfig::default(),
    );
    paper.set_price(&btc(), dec!(50));
    paper.set_fill_mode(FillMode::Deferred);

    let placing = {
        let master = master.clone();
        tokio::spawn(async move { master.place_order(&buy(dec!(100)), dec!(50)).await })
    };
    // First poll answered, placement is now waiting out the window
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(paper.calls(PaperOp::Status), 1);

    let balance = tokio::time::timeout(Duration::from_millis(100), alice.get_balance())
        .await
        .expect("balance call waited on another account's verify window");
    assert_eq!(balance.unwrap().cash, dec!(1000));
    assert!(!placing.is_finished());

    let execution = placing.await.unwrap().unwrap();
    assert!(matches!(execution, Execution::Pending(_)));
    assert_eq!(paper.calls(PaperOp::Status), 2);
}

#[tokio::test]
async fn test_retry_after_rate_limit_reuses_client_id() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_price(&btc(), dec!(50));
    paper.inject_fault(PaperOp::Place, BrokerError::RateLimited("429".into()));

    let request = buy(dec!(100));
    let execution = broker.place_order(&request, dec!(50)).await.unwrap();
    let Execution::Filled(report) = execution else {
        panic!("expected a fill");
    };
    assert_eq!(report.handle.client_order_id, request.client_order_id);
    assert_eq!(paper.orders_accepted(), 1);
}

#[tokio::test]
async fn test_unconfirmed_order_is_pending() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_price(&btc(), dec!(50));
    paper.set_fill_mode(FillMode::Deferred);

    let execution = broker.place_order(&buy(dec!(100)), dec!(50)).await.unwrap();
    let Execution::Pending(handle) = execution else {
        panic!("expected pending");
    };
    assert_eq!(paper.calls(PaperOp::Status), 2);

    paper.settle_open_orders();
    let report = broker.order_status(&handle).await.unwrap();
    assert_eq!(report.status, OrderStatus::Filled);

    let found = broker.find_order(&btc(), handle.client_order_id).await.unwrap();
    assert_eq!(found, Some(handle));
}

#[tokio::test]
async fn test_cancel_pending_order() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_price(&btc(), dec!(50));
    paper.set_fill_mode(FillMode::Deferred);

    let Execution::Pending(handle) = broker.place_order(&buy(dec!(20)), dec!(50)).await.unwrap()
    else {
        panic!("expected pending");
    };
    broker.cancel_order(&handle).await.unwrap();
    let report = broker.order_status(&handle).await.unwrap();
    assert_eq!(report.status, OrderStatus::Canceled);
}

#[tokio::test]
async fn test_invalid_nonce_jumps_ledger_and_retries() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    paper.set_price(&btc(), dec!(50));
    broker.get_balance().await.unwrap();
    let before = harness.authority.snapshot(ExchangeId::Kraken);

    paper.inject_fault(PaperOp::Place, BrokerError::InvalidNonce("EAPI:Invalid nonce".into()));
    let execution = broker.place_order(&buy(dec!(100)), dec!(50)).await.unwrap();
    assert!(matches!(execution, Execution::Filled(_)));

    let after = harness.authority.snapshot(ExchangeId::Kraken);
    assert_eq!(after.rejections, 1);
    assert!(after.last_issued >= before.last_issued + 60_000_000);
}

#[tokio::test]
async fn test_unsupported_quote_rejected_locally() {
    let harness = Harness::new();
    let (broker, paper) = harness.master();
    let eur = OrderRequest::market(Symbol::new("BTC", "EUR"), Side::Buy, OrderSize::Quote(dec!(50)));

    let err = broker.place_order(&eur, dec!(50)).await.unwrap_err();
    assert_eq!(err.to_string(), "BTC-EUR is not supported on kraken");
    assert_eq!(paper.calls(PaperOp::Place), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accounts_on_one_exchange_never_overlap_requests() {
    let harness = Harness::new();
    let slow = PaperConfig {
        latency: Duration::from_millis(2),
        ..PaperConfig::default()
    };

    let mut tasks = Vec::new();
    for role in ["master", "alice", "bob"] {
        let account = if role == "master" {
            AccountId::master(ExchangeId::Kraken)
        } else {
            AccountId::user(ExchangeId::Kraken, role)
        };
        let (broker, _paper) = harness.account(account, slow.clone());
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                broker.get_balance().await?;
            }
            Ok::<_, BrokerError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(harness.gate.max_in_flight(), 1);
    let accepted = harness.gate.accepted();
    assert_eq!(accepted.len(), 30);
    assert!(accepted.windows(2).all(|w| w[0] < w[1]));
}
