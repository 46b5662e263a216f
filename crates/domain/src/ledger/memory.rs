use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MemberId, OrderId};
use tokio::sync::RwLock;

use super::{LedgerError, OrderLedger, Result, check_transition};
use crate::order::{Order, OrderStatus, StatusTransition};

/// In-memory order ledger for testing.
///
/// Provides the same compare-and-set and uniqueness guarantees as the
/// PostgreSQL implementation, plus switches for injecting failures.
#[derive(Clone, Default)]
pub struct InMemoryOrderLedger {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
    fail_on_insert: Arc<AtomicBool>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOrderLedger {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next inserts fail as if the database rejected the write.
    pub fn set_fail_on_insert(&self, fail: bool) {
        self.fail_on_insert.store(fail, Ordering::SeqCst);
    }

    /// Makes every operation fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("order store unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderLedger for InMemoryOrderLedger {
    async fn insert(&self, order: &Order) -> Result<()> {
        self.check_available()?;
        if self.fail_on_insert.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("simulated insert failure".to_string()));
        }

        let mut orders = self.orders.write().await;
        let duplicate_key = order.idempotency_key().is_some_and(|key| {
            orders.values().any(|existing| {
                existing.owner_id == order.owner_id && existing.idempotency_key() == Some(key)
            })
        });
        if duplicate_key || orders.contains_key(&order.id) {
            return Err(LedgerError::DuplicateOrder {
                owner_id: order.owner_id,
            });
        }

        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>> {
        self.check_available()?;
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        owner_id: MemberId,
        key: &str,
    ) -> Result<Option<Order>> {
        self.check_available()?;
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|order| order.owner_id == owner_id && order.idempotency_key() == Some(key))
            .cloned())
    }

    async fn compare_and_set_status(&self, transition: &StatusTransition) -> Result<Order> {
        self.check_available()?;
        check_transition(transition)?;

        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&transition.order_id)
            .ok_or(LedgerError::NotFound(transition.order_id))?;

        if order.status != transition.from {
            return Err(LedgerError::StaleStatus {
                order_id: transition.order_id,
                expected: transition.from,
                actual: order.status,
            });
        }

        order.apply(transition);
        Ok(order.clone())
    }

    async fn list_due(&self, status: OrderStatus, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        self.check_available()?;
        let orders = self.orders.read().await;
        let mut due: Vec<_> = orders
            .values()
            .filter(|order| order.status == status)
            .filter(|order| order.status_entered_at().is_some_and(|since| since <= cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|order| order.status_entered_at());
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Money, OrderLine};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn order(owner: MemberId, key: Option<&str>) -> Order {
        Order::place(
            owner,
            vec![OrderLine::new("SKU-001", "Widget", Money::from_cents(1000), 2)],
            key.map(str::to_string),
            now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let ledger = InMemoryOrderLedger::new();
        let order = order(MemberId::new(), None);

        ledger.insert(&order).await.unwrap();
        let loaded = ledger.get(order.id()).await.unwrap().unwrap();
        assert_eq!(loaded, order);
        assert!(ledger.get(OrderId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_rejected() {
        let ledger = InMemoryOrderLedger::new();
        let owner = MemberId::new();

        ledger.insert(&order(owner, Some("k-1"))).await.unwrap();
        let result = ledger.insert(&order(owner, Some("k-1"))).await;
        assert!(matches!(result, Err(LedgerError::DuplicateOrder { .. })));

        // Same key, different owner is fine.
        ledger.insert(&order(MemberId::new(), Some("k-1"))).await.unwrap();
        assert_eq!(ledger.order_count().await, 2);

        let found = ledger.find_by_idempotency_key(owner, "k-1").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_compare_and_set_detects_stale_status() {
        let ledger = InMemoryOrderLedger::new();
        let order = order(MemberId::new(), None);
        ledger.insert(&order).await.unwrap();

        let cancel = order.cancel(now()).unwrap();
        let deliver = order
            .scheduled_transition(now() + Duration::days(1), Duration::days(1))
            .unwrap();

        let updated = ledger.compare_and_set_status(&cancel).await.unwrap();
        assert_eq!(updated.status(), OrderStatus::Cancelled);

        let result = ledger.compare_and_set_status(&deliver).await;
        assert!(matches!(
            result,
            Err(LedgerError::StaleStatus {
                expected: OrderStatus::OrderReceived,
                actual: OrderStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let ledger = InMemoryOrderLedger::new();
        let order = order(MemberId::new(), None);
        ledger.insert(&order).await.unwrap();

        let bogus = StatusTransition {
            order_id: order.id(),
            from: OrderStatus::OrderReceived,
            to: OrderStatus::ReturnCompleted,
            at: now(),
        };
        let result = ledger.compare_and_set_status(&bogus).await;
        assert!(matches!(result, Err(LedgerError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn test_list_due_respects_cutoff() {
        let ledger = InMemoryOrderLedger::new();
        let order = order(MemberId::new(), None);
        ledger.insert(&order).await.unwrap();

        let early = ledger
            .list_due(OrderStatus::OrderReceived, now() - Duration::hours(1))
            .await
            .unwrap();
        assert!(early.is_empty());

        let due = ledger.list_due(OrderStatus::OrderReceived, now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(ledger.list_due(OrderStatus::Delivering, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let ledger = InMemoryOrderLedger::new();
        ledger.set_fail_on_insert(true);
        let result = ledger.insert(&order(MemberId::new(), None)).await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(ledger.order_count().await, 0);

        ledger.set_fail_on_insert(false);
        ledger.set_unavailable(true);
        assert!(ledger.get(OrderId::new()).await.is_err());
    }
}
