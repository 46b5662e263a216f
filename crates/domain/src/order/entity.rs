//! The persisted order record and its status transitions.

use chrono::{DateTime, Duration, Utc};
use common::{MemberId, OrderId};
use serde::{Deserialize, Serialize};

use super::{Money, OrderError, OrderLine, OrderStatus};

/// An order placed by a member.
///
/// Created only after every line was reserved, and changed afterwards only
/// through [`StatusTransition`]s applied by an order ledger. Orders are never
/// deleted; cancellation and return are terminal statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub(crate) id: OrderId,
    pub(crate) owner_id: MemberId,
    pub(crate) total_amount: Money,
    pub(crate) status: OrderStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) delivery_start_date: Option<DateTime<Utc>>,
    pub(crate) delivery_complete_date: Option<DateTime<Utc>>,
    pub(crate) return_request_date: Option<DateTime<Utc>>,
    pub(crate) lines: Vec<OrderLine>,
    pub(crate) idempotency_key: Option<String>,
}

/// A single compare-and-set status change for one order.
///
/// `from` is the status the change was decided against; a ledger refuses the
/// change if the stored status no longer matches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub at: DateTime<Utc>,
}

impl Order {
    /// Builds a new order in `ORDER_RECEIVED` from priced line snapshots.
    pub fn place(
        owner_id: MemberId,
        lines: Vec<OrderLine>,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        if lines.is_empty() {
            return Err(OrderError::NoItems);
        }
        if let Some(line) = lines.iter().find(|line| line.quantity == 0) {
            return Err(OrderError::InvalidQuantity {
                product_id: line.product_id.to_string(),
                quantity: line.quantity,
            });
        }

        let total_amount = lines.iter().map(OrderLine::line_total).sum();
        Ok(Self {
            id: OrderId::new(),
            owner_id,
            total_amount,
            status: OrderStatus::OrderReceived,
            created_at: now,
            delivery_start_date: None,
            delivery_complete_date: None,
            return_request_date: None,
            lines,
            idempotency_key,
        })
    }

    /// Plans an owner cancellation.
    pub fn cancel(&self, now: DateTime<Utc>) -> Result<StatusTransition, OrderError> {
        if !self.status.can_cancel() {
            return Err(OrderError::InvalidStateTransition {
                current: self.status,
                action: "cancel",
            });
        }
        Ok(self.transition_to(OrderStatus::Cancelled, now))
    }

    /// Plans an owner return request.
    ///
    /// Allowed only while `now` is strictly before the delivery completion
    /// date plus `window`.
    pub fn request_return(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<StatusTransition, OrderError> {
        if !self.status.can_request_return() {
            return Err(OrderError::InvalidStateTransition {
                current: self.status,
                action: "request return",
            });
        }

        let delivered_at = self.delivery_complete_date.unwrap_or(self.created_at);
        if now >= delivered_at + window {
            return Err(OrderError::ReturnWindowExpired { delivered_at });
        }
        Ok(self.transition_to(OrderStatus::ReturnRequested, now))
    }

    /// Plans the time-driven transition, if the order has aged at least
    /// `min_age` in its current status.
    pub fn scheduled_transition(
        &self,
        now: DateTime<Utc>,
        min_age: Duration,
    ) -> Option<StatusTransition> {
        let next = self.status.scheduled_next()?;
        let since = self.status_entered_at()?;
        (since + min_age <= now).then(|| self.transition_to(next, now))
    }

    /// When the order entered its current status, for the statuses the
    /// sweep ages.
    pub fn status_entered_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            OrderStatus::OrderReceived => Some(self.created_at),
            OrderStatus::Delivering => self.delivery_start_date,
            OrderStatus::ReturnRequested => self.return_request_date,
            OrderStatus::DeliveryCompleted => self.delivery_complete_date,
            OrderStatus::Cancelled | OrderStatus::ReturnCompleted => None,
        }
    }

    fn transition_to(&self, to: OrderStatus, at: DateTime<Utc>) -> StatusTransition {
        StatusTransition {
            order_id: self.id,
            from: self.status,
            to,
            at,
        }
    }

    /// Applies a transition whose `from` has already been checked.
    pub(crate) fn apply(&mut self, transition: &StatusTransition) {
        self.status = transition.to;
        match transition.to {
            OrderStatus::Delivering => self.delivery_start_date = Some(transition.at),
            OrderStatus::DeliveryCompleted => self.delivery_complete_date = Some(transition.at),
            OrderStatus::ReturnRequested => self.return_request_date = Some(transition.at),
            OrderStatus::OrderReceived
            | OrderStatus::Cancelled
            | OrderStatus::ReturnCompleted => {}
        }
    }
}

// Query methods
impl Order {
    /// Returns the order ID.
    pub fn id(&self) -> OrderId {
        self.id
    }

    /// Returns the member who placed the order.
    pub fn owner_id(&self) -> MemberId {
        self.owner_id
    }

    /// Returns true if `member` placed this order.
    pub fn is_owned_by(&self, member: MemberId) -> bool {
        self.owner_id == member
    }

    /// Returns the current status.
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Returns the total amount.
    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn delivery_start_date(&self) -> Option<DateTime<Utc>> {
        self.delivery_start_date
    }

    pub fn delivery_complete_date(&self) -> Option<DateTime<Utc>> {
        self.delivery_complete_date
    }

    pub fn return_request_date(&self) -> Option<DateTime<Utc>> {
        self.return_request_date
    }

    /// Returns the line snapshots captured at creation.
    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    /// Returns the client idempotency key the order was created with.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// Returns true if the order is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn placed(now: DateTime<Utc>) -> Order {
        Order::place(
            MemberId::new(),
            vec![
                OrderLine::new("SKU-001", "Widget", Money::from_cents(1000), 2),
                OrderLine::new("SKU-002", "Gadget", Money::from_cents(550), 1),
            ],
            None,
            now,
        )
        .unwrap()
    }

    fn advance(order: &mut Order, now: DateTime<Utc>) {
        let transition = order.scheduled_transition(now, Duration::days(1)).unwrap();
        order.apply(&transition);
    }

    #[test]
    fn test_place_computes_total() {
        let order = placed(at(1, 9));
        assert_eq!(order.status(), OrderStatus::OrderReceived);
        assert_eq!(order.total_amount().cents(), 2550);
        assert_eq!(order.lines().len(), 2);
    }

    #[test]
    fn test_place_rejects_empty_and_zero_quantity() {
        let owner = MemberId::new();
        assert!(matches!(
            Order::place(owner, vec![], None, at(1, 9)),
            Err(OrderError::NoItems)
        ));

        let zero = vec![OrderLine::new("SKU-001", "Widget", Money::from_cents(1000), 0)];
        assert!(matches!(
            Order::place(owner, zero, None, at(1, 9)),
            Err(OrderError::InvalidQuantity { quantity: 0, .. })
        ));
    }

    #[test]
    fn test_cancel_only_from_order_received() {
        let mut order = placed(at(1, 9));
        let transition = order.cancel(at(1, 10)).unwrap();
        assert_eq!(transition.from, OrderStatus::OrderReceived);
        assert_eq!(transition.to, OrderStatus::Cancelled);

        advance(&mut order, at(2, 9));
        assert_eq!(order.status(), OrderStatus::Delivering);
        assert!(matches!(
            order.cancel(at(2, 10)),
            Err(OrderError::InvalidStateTransition {
                current: OrderStatus::Delivering,
                ..
            })
        ));
    }

    #[test]
    fn test_sweep_waits_a_full_day() {
        let order = placed(at(1, 9));
        assert!(order.scheduled_transition(at(2, 8), Duration::days(1)).is_none());
        assert!(order.scheduled_transition(at(2, 9), Duration::days(1)).is_some());
    }

    #[test]
    fn test_apply_sets_status_dates() {
        let mut order = placed(at(1, 9));
        advance(&mut order, at(2, 9));
        assert_eq!(order.delivery_start_date(), Some(at(2, 9)));

        advance(&mut order, at(3, 9));
        assert_eq!(order.status(), OrderStatus::DeliveryCompleted);
        assert_eq!(order.delivery_complete_date(), Some(at(3, 9)));
        assert!(order.scheduled_transition(at(9, 9), Duration::days(1)).is_none());
    }

    #[test]
    fn test_return_window() {
        let mut order = placed(at(1, 9));
        advance(&mut order, at(2, 9));
        advance(&mut order, at(3, 9));

        let ok = order.request_return(at(4, 8), Duration::days(1)).unwrap();
        assert_eq!(ok.to, OrderStatus::ReturnRequested);

        assert!(matches!(
            order.request_return(at(4, 9), Duration::days(1)),
            Err(OrderError::ReturnWindowExpired { .. })
        ));
        assert!(matches!(
            order.request_return(at(5, 9), Duration::days(1)),
            Err(OrderError::ReturnWindowExpired { .. })
        ));
    }

    #[test]
    fn test_return_requires_delivery() {
        let order = placed(at(1, 9));
        assert!(matches!(
            order.request_return(at(1, 10), Duration::days(1)),
            Err(OrderError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_return_completes_after_a_day() {
        let mut order = placed(at(1, 9));
        advance(&mut order, at(2, 9));
        advance(&mut order, at(3, 9));
        let request = order.request_return(at(3, 12), Duration::days(1)).unwrap();
        order.apply(&request);

        assert!(order.scheduled_transition(at(4, 11), Duration::days(1)).is_none());
        advance(&mut order, at(4, 12));
        assert_eq!(order.status(), OrderStatus::ReturnCompleted);
        assert!(order.is_terminal());
    }
}
