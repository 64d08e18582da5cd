//! Exit Lifecycle Integration Test
//!
//! Walks one position through entry, a ladder exit and a stop-loss, the way a
//! supervisor drives the engine across cycles.

use chrono::{Duration, Utc};
use meridian_core::{AccountId, ExchangeId, ExitReason, PositionSide, Symbol};
use meridian_order_manager::{
    ExitEngine, ExitRules, Fill, OrderIntent, PendingOrders, PositionState, ProfitRung, Resolution,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

fn scenario_rules() -> ExitRules {
    ExitRules {
        round_trip_fee_pct: dec!(1.4),
        profit_ladder: vec![
            ProfitRung::new(dec!(0.5), dec!(25)),
            ProfitRung::new(dec!(1.0), dec!(25)),
            ProfitRung::new(dec!(2.0), dec!(50)),
        ],
        trailing: None,
        stop_loss_pct: dec!(1.0),
        max_hold_minutes: 24 * 60,
    }
}

fn marks(symbol: &Symbol, price: Decimal) -> HashMap<Symbol, Decimal> {
    HashMap::from([(symbol.clone(), price)])
}

#[test]
fn test_ladder_then_stop_loss() {
    let _ = env_logger::try_init();
    let account = AccountId::master(ExchangeId::Kraken);
    let btc = Symbol::new("BTC", "USD");
    let mut engine = ExitEngine::new(account.clone(), scenario_rules(), dec!(10)).unwrap();
    let mut clock = Utc::now();

    // $100 long at $50.00
    engine
        .apply_entry(&btc, PositionSide::Long, Fill::new(dec!(2), dec!(50.00)), clock)
        .unwrap();

    // Cycle 1: $51.20 is +2.4 % gross, +1.0 % net
    clock += Duration::minutes(5);
    engine.mark_to_market(&marks(&btc, dec!(51.20)));
    let exits = engine.evaluate_all(&marks(&btc, dec!(51.20)), clock);
    assert_eq!(exits.len(), 1);
    let ladder = &exits[0];
    assert_eq!(ladder.reason, ExitReason::ProfitTarget { rung: 1 });
    assert!(!ladder.full);
    assert_eq!(ladder.quantity, dec!(0.5));
    assert!(engine
        .commit_exit(ladder, Fill::new(ladder.quantity, dec!(51.20)), clock)
        .unwrap()
        .is_none());

    let position = engine.position(&btc).unwrap();
    assert_eq!(position.state, PositionState::PartialExit);
    assert_eq!(position.remaining_fraction(), dec!(0.75));

    // Cycle 2: same price again, nothing re-fires
    clock += Duration::minutes(5);
    assert!(engine.evaluate_all(&marks(&btc, dec!(51.20)), clock).is_empty());

    // Cycle 3: $49.50 is -1.0 % gross
    clock += Duration::minutes(5);
    engine.mark_to_market(&marks(&btc, dec!(49.50)));
    let exits = engine.evaluate_all(&marks(&btc, dec!(49.50)), clock);
    assert_eq!(exits.len(), 1);
    let stop = &exits[0];
    assert_eq!(stop.reason, ExitReason::StopLoss);
    assert!(stop.full);
    assert_eq!(stop.quantity, dec!(1.5));

    let result = engine
        .commit_exit(stop, Fill::new(stop.quantity, dec!(49.50)), clock)
        .unwrap()
        .unwrap();
    assert_eq!(result.account, account);
    assert_eq!(result.exit_reason, ExitReason::StopLoss);
    assert_eq!(result.partial_exits, 1);
    assert_eq!(result.net_pnl_pct, dec!(-1.55));
    assert!(result.is_loss());
    assert_eq!(engine.open_count(), 0);
}

#[test]
fn test_unconfirmed_exit_reconciled_next_cycle() {
    let btc = Symbol::new("BTC", "USD");
    let mut engine = ExitEngine::new(
        AccountId::user(ExchangeId::Coinbase, "alice"),
        scenario_rules(),
        dec!(10),
    )
    .unwrap();
    let mut pending = PendingOrders::new();
    let opened = Utc::now();
    engine
        .apply_entry(&btc, PositionSide::Long, Fill::new(dec!(1), dec!(100)), opened)
        .unwrap();

    let decision = engine.evaluate(&btc, dec!(98), opened).unwrap();
    engine.mark_exit_pending(&decision).unwrap();
    let handle = meridian_core::OrderHandle {
        order_id: "X-1".into(),
        client_order_id: uuid::Uuid::new_v4(),
        symbol: btc.clone(),
    };
    pending.track(handle.clone(), OrderIntent::Exit(decision.clone()), opened);

    // Cycle skips the position while its exit is outstanding
    assert!(engine.evaluate(&btc, dec!(97), opened).is_none());

    let report = meridian_core::ExecutionReport {
        handle,
        side: decision.order_side(),
        status: meridian_core::OrderStatus::Filled,
        filled_qty: dec!(1),
        avg_price: Some(dec!(98)),
        fee: dec!(0.1),
    };
    let Resolution::Filled(order, fill) = pending.resolve(&report, opened, Duration::minutes(10))
    else {
        panic!("expected the pending exit to resolve as filled");
    };
    let OrderIntent::Exit(decision) = order.intent else {
        panic!("expected an exit intent");
    };
    let result = engine
        .resolve_pending_exit(&decision, Some(fill), opened)
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_reason, ExitReason::StopLoss);
    assert_eq!(result.net_pnl_pct, dec!(-3.4));
    assert!(pending.is_empty());
}
