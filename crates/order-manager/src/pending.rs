//! Orders accepted by the exchange but not yet confirmed
//!
//! The book is pure bookkeeping: the supervisor queries the exchange and
//! feeds each report to [`PendingOrders::resolve`], which says what to do.
//!
//! Orders whose submission ended ambiguously (no acknowledgement, unreadable
//! answer) and that could not be found yet sit in a second list keyed by
//! client order id until a lookup turns them into tracked orders.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use meridian_core::{ExecutionReport, OrderHandle, PositionSide, Symbol};
use std::collections::HashMap;
use uuid::Uuid;

use crate::engine::{ExitDecision, Fill};

/// What a pending order was meant to do
#[derive(Debug, Clone, PartialEq)]
pub enum OrderIntent {
    Entry { symbol: Symbol, side: PositionSide },
    Exit(ExitDecision),
}

impl OrderIntent {
    pub fn symbol(&self) -> &Symbol {
        match self {
            OrderIntent::Entry { symbol, .. } => symbol,
            OrderIntent::Exit(decision) => &decision.symbol,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub handle: OrderHandle,
    pub intent: OrderIntent,
    pub submitted_at: DateTime<Utc>,
}

/// An order that may have reached the exchange but has no exchange id yet
#[derive(Debug, Clone, PartialEq)]
pub struct UnconfirmedOrder {
    pub symbol: Symbol,
    pub client_order_id: Uuid,
    pub intent: OrderIntent,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of checking one pending order against its latest report
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Has fills; apply them to the position set
    Filled(PendingOrder, Fill),
    /// Ended without fills; nothing to apply
    Released(PendingOrder),
    /// Still open past the expiry; cancel it on the exchange
    Expired(PendingOrder),
    /// Still open; check again next cycle
    Waiting,
}

/// Pending orders of one account, keyed by exchange order id
#[derive(Debug, Default)]
pub struct PendingOrders {
    orders: HashMap<String, PendingOrder>,
    unconfirmed: HashMap<Uuid, UnconfirmedOrder>,
}

impl PendingOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, handle: OrderHandle, intent: OrderIntent, submitted_at: DateTime<Utc>) {
        debug!(
            "[PENDING] tracking {} for {}",
            handle.order_id,
            intent.symbol()
        );
        self.orders.insert(
            handle.order_id.clone(),
            PendingOrder {
                handle,
                intent,
                submitted_at,
            },
        );
    }

    /// Remember an ambiguous submission until it can be looked up
    pub fn track_unconfirmed(
        &mut self,
        symbol: Symbol,
        client_order_id: Uuid,
        intent: OrderIntent,
        submitted_at: DateTime<Utc>,
    ) {
        debug!("[PENDING] looking for {} on {} next cycle", client_order_id, symbol);
        self.unconfirmed.insert(
            client_order_id,
            UnconfirmedOrder {
                symbol,
                client_order_id,
                intent,
                submitted_at,
            },
        );
    }

    /// Submissions still waiting for a lookup
    pub fn unconfirmed(&self) -> Vec<UnconfirmedOrder> {
        self.unconfirmed.values().cloned().collect()
    }

    pub fn take_unconfirmed(&mut self, client_order_id: &Uuid) -> Option<UnconfirmedOrder> {
        self.unconfirmed.remove(client_order_id)
    }

    /// Tracked plus unconfirmed orders
    pub fn len(&self) -> usize {
        self.orders.len() + self.unconfirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.unconfirmed.is_empty()
    }

    pub fn get(&self, order_id: &str) -> Option<&PendingOrder> {
        self.orders.get(order_id)
    }

    /// Handles of every pending order, for querying the exchange
    pub fn handles(&self) -> Vec<OrderHandle> {
        self.orders.values().map(|o| o.handle.clone()).collect()
    }

    fn intents(&self) -> impl Iterator<Item = &OrderIntent> {
        self.orders
            .values()
            .map(|o| &o.intent)
            .chain(self.unconfirmed.values().map(|o| &o.intent))
    }

    /// Whether an entry for `symbol` is still outstanding
    pub fn has_entry_for(&self, symbol: &Symbol) -> bool {
        self.intents()
            .any(|intent| matches!(intent, OrderIntent::Entry { symbol: s, .. } if s == symbol))
    }

    /// Outstanding entries; they count against position limits
    pub fn entry_count(&self) -> usize {
        self.intents()
            .filter(|intent| matches!(intent, OrderIntent::Entry { .. }))
            .count()
    }

    pub fn remove(&mut self, order_id: &str) -> Option<PendingOrder> {
        self.orders.remove(order_id)
    }

    /// Decide what to do with a pending order given its latest report
    ///
    /// Filled, released and expired orders leave the book. An expired order
    /// whose cancel then fails should be tracked again by the caller.
    pub fn resolve(
        &mut self,
        report: &ExecutionReport,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Resolution {
        let order_id = &report.handle.order_id;
        let Some(order) = self.orders.get(order_id) else {
            return Resolution::Waiting;
        };

        if report.status.is_terminal() {
            let Some(order) = self.orders.remove(order_id) else {
                return Resolution::Waiting;
            };
            return match Fill::from_report(report) {
                Some(fill) => Resolution::Filled(order, fill),
                None => Resolution::Released(order),
            };
        }

        if now - order.submitted_at >= expiry {
            if let Some(order) = self.orders.remove(order_id) {
                return Resolution::Expired(order);
            }
        }
        Resolution::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{OrderStatus, Side};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn handle(id: &str) -> OrderHandle {
        OrderHandle {
            order_id: id.to_string(),
            client_order_id: Uuid::new_v4(),
            symbol: Symbol::new("BTC", "USD"),
        }
    }

    fn report(handle: &OrderHandle, status: OrderStatus, filled: rust_decimal::Decimal) -> ExecutionReport {
        ExecutionReport {
            handle: handle.clone(),
            side: Side::Buy,
            status,
            filled_qty: filled,
            avg_price: if filled.is_zero() { None } else { Some(dec!(50)) },
            fee: dec!(0),
        }
    }

    fn entry() -> OrderIntent {
        OrderIntent::Entry {
            symbol: Symbol::new("BTC", "USD"),
            side: PositionSide::Long,
        }
    }

    #[test]
    fn test_filled_order_leaves_book() {
        let now = Utc::now();
        let mut book = PendingOrders::new();
        let h = handle("A");
        book.track(h.clone(), entry(), now);
        assert!(book.has_entry_for(&Symbol::new("BTC", "USD")));

        let resolution = book.resolve(&report(&h, OrderStatus::Filled, dec!(2)), now, Duration::minutes(5));
        assert!(matches!(resolution, Resolution::Filled(_, fill) if fill.quantity == dec!(2)));
        assert!(book.is_empty());
    }

    #[test]
    fn test_canceled_without_fills_is_released() {
        let now = Utc::now();
        let mut book = PendingOrders::new();
        let h = handle("B");
        book.track(h.clone(), entry(), now);
        let resolution = book.resolve(&report(&h, OrderStatus::Canceled, dec!(0)), now, Duration::minutes(5));
        assert!(matches!(resolution, Resolution::Released(_)));
    }

    #[test]
    fn test_unconfirmed_submission_counts_as_outstanding() {
        let now = Utc::now();
        let mut book = PendingOrders::new();
        let client_order_id = Uuid::new_v4();
        book.track_unconfirmed(Symbol::new("BTC", "USD"), client_order_id, entry(), now);

        assert_eq!(book.len(), 1);
        assert!(!book.is_empty());
        assert!(book.handles().is_empty());
        assert!(book.has_entry_for(&Symbol::new("BTC", "USD")));
        assert_eq!(book.entry_count(), 1);

        let found = book.take_unconfirmed(&client_order_id).unwrap();
        assert_eq!(found.intent, entry());
        book.track(handle("D"), found.intent, found.submitted_at);
        assert_eq!(book.len(), 1);
        assert!(book.unconfirmed().is_empty());
    }

    #[test]
    fn test_open_order_expires() {
        let submitted = Utc::now();
        let mut book = PendingOrders::new();
        let h = handle("C");
        book.track(h.clone(), entry(), submitted);
        let open = report(&h, OrderStatus::Open, dec!(0));

        assert_eq!(book.resolve(&open, submitted + Duration::minutes(1), Duration::minutes(5)), Resolution::Waiting);
        assert_eq!(book.len(), 1);
        assert!(matches!(
            book.resolve(&open, submitted + Duration::minutes(5), Duration::minutes(5)),
            Resolution::Expired(_)
        ));
        assert!(book.is_empty());
    }
}
