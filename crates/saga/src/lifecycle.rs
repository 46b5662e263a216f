//! Order creation and the order status state machine.
//!
//! ```text
//! ORDER_RECEIVED ──sweep──► DELIVERING ──sweep──► DELIVERY_COMPLETED
//!       │                                               │
//!     cancel                                      request return
//!       ▼                                               ▼
//!   CANCELLED              RETURN_COMPLETED ◄──sweep── RETURN_REQUESTED
//! ```
//!
//! Every status write goes through the order ledger's compare-and-set, so a
//! user action and the sweep racing on one order cannot both win.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use common::{MemberId, OrderId};
use domain::{
    Catalog, ChannelMessage, LedgerError, LineItem, Money, Order, OrderEvent, OrderEventType,
    OrderLedger, OrderLine, OrderStatus, StatusTransition,
};
use event_channel::EventChannel;
use serde::{Deserialize, Serialize};
use stock::StockLedger;

use crate::clock::{Clock, SystemClock};
use crate::coordinator::{ReleaseReason, StockReservationCoordinator};
use crate::error::{FulfillmentError, Result};
use crate::reservation::ReservationFailure;

/// Time guards of the state machine.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Age in `ORDER_RECEIVED` before delivery starts.
    pub delivery_start_after: Duration,
    /// Age in `DELIVERING` before delivery completes.
    pub delivery_complete_after: Duration,
    /// How long after delivery a return may be requested.
    pub return_window: Duration,
    /// Age in `RETURN_REQUESTED` before the return completes.
    pub return_complete_after: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            delivery_start_after: Duration::days(1),
            delivery_complete_after: Duration::days(1),
            return_window: Duration::days(1),
            return_complete_after: Duration::days(1),
        }
    }
}

impl LifecycleConfig {
    /// Statuses the sweep advances, with the age each must reach first.
    fn sweep_stages(&self) -> [(OrderStatus, Duration); 3] {
        [
            (OrderStatus::OrderReceived, self.delivery_start_after),
            (OrderStatus::Delivering, self.delivery_complete_after),
            (OrderStatus::ReturnRequested, self.return_complete_after),
        ]
    }
}

/// Result of a successful `create_order`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub total_amount: Money,
}

impl From<&Order> for OrderReceipt {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            status: order.status(),
            total_amount: order.total_amount(),
        }
    }
}

/// An order as shown to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: OrderId,
    pub owner_id: MemberId,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub created_at: DateTime<Utc>,
    pub delivery_start_date: Option<DateTime<Utc>>,
    pub delivery_complete_date: Option<DateTime<Utc>>,
    pub return_request_date: Option<DateTime<Utc>>,
    pub lines: Vec<OrderLine>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            owner_id: order.owner_id(),
            status: order.status(),
            total_amount: order.total_amount(),
            created_at: order.created_at(),
            delivery_start_date: order.delivery_start_date(),
            delivery_complete_date: order.delivery_complete_date(),
            return_request_date: order.return_request_date(),
            lines: order.lines().to_vec(),
        }
    }
}

/// Outcome of one lifecycle sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Transitions the sweep applied.
    pub advanced: Vec<StatusTransition>,
    /// Orders another writer changed first.
    pub stale: usize,
    /// Orders left for the next sweep after a store error.
    pub failed: usize,
}

/// Creates orders and moves them through their statuses.
pub struct OrderLifecycleEngine<O, S, C, K>
where
    O: OrderLedger,
    S: StockLedger,
    C: EventChannel,
    K: Catalog,
{
    orders: O,
    coordinator: StockReservationCoordinator<S, C>,
    catalog: K,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl<O, S, C, K> OrderLifecycleEngine<O, S, C, K>
where
    O: OrderLedger,
    S: StockLedger,
    C: EventChannel,
    K: Catalog,
{
    /// Creates an engine on the system clock with default time guards.
    pub fn new(orders: O, coordinator: StockReservationCoordinator<S, C>, catalog: K) -> Self {
        Self {
            orders,
            coordinator,
            catalog,
            clock: Arc::new(SystemClock),
            config: LifecycleConfig::default(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the time guards.
    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn orders(&self) -> &O {
        &self.orders
    }

    pub fn coordinator(&self) -> &StockReservationCoordinator<S, C> {
        &self.coordinator
    }

    /// Places an order: prices the lines, reserves stock, then persists.
    ///
    /// No order is stored unless every line was reserved, and a reservation
    /// is given back if the order cannot be stored. With an idempotency key,
    /// a repeated submission returns the order the first one created.
    #[tracing::instrument(skip(self, items, idempotency_key), fields(lines = items.len()))]
    pub async fn create_order(
        &self,
        owner_id: MemberId,
        items: &[LineItem],
        idempotency_key: Option<String>,
    ) -> Result<OrderReceipt> {
        let started = Instant::now();
        validate_items(items)?;

        if let Some(key) = idempotency_key.as_deref()
            && let Some(existing) = self.find_by_key(owner_id, key).await?
        {
            tracing::info!(order_id = %existing.id(), "repeated submission, returning existing order");
            return Ok(OrderReceipt::from(&existing));
        }

        let items = LineItem::normalize(items);
        let lines = self.price_lines(&items).await?;
        let order = Order::place(owner_id, lines, idempotency_key, self.clock.now())?;

        let attempt = self.coordinator.reserve_all(&items).await;
        if let Some(failure) = attempt.failure() {
            return Err(reservation_error(failure));
        }

        if let Err(e) = self.orders.insert(&order).await {
            self.coordinator
                .release_all(order.id(), &items, ReleaseReason::PersistenceFailed)
                .await;

            return match (e, order.idempotency_key()) {
                (LedgerError::DuplicateOrder { .. }, Some(key)) => {
                    let winner = self
                        .find_by_key(owner_id, key)
                        .await?
                        .ok_or_else(|| FulfillmentError::transient("duplicate order vanished"))?;
                    tracing::info!(order_id = %winner.id(), "lost idempotency race, returning winner");
                    Ok(OrderReceipt::from(&winner))
                }
                (e, _) => Err(FulfillmentError::transient(e)),
            };
        }

        self.coordinator.confirm(order.id(), &attempt).await;
        self.publish_order_event(&order, OrderEventType::OrderCreated)
            .await;

        metrics::counter!("orders_created_total").increment(1);
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(order_id = %order.id(), total = %order.total_amount(), "order created");

        Ok(OrderReceipt::from(&order))
    }

    /// Cancels an order that has not started delivery and gives its stock back.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId, owner_id: MemberId) -> Result<()> {
        let order = self.load_owned(order_id, owner_id).await?;
        let transition = order.cancel(self.clock.now())?;
        let updated = self.apply_user_transition(&transition, "cancel").await?;

        self.after_transition(&updated, &transition).await;
        Ok(())
    }

    /// Requests a return of a delivered order within the return window.
    #[tracing::instrument(skip(self))]
    pub async fn request_return(&self, order_id: OrderId, owner_id: MemberId) -> Result<()> {
        let order = self.load_owned(order_id, owner_id).await?;
        let transition = order.request_return(self.clock.now(), self.config.return_window)?;
        let updated = self
            .apply_user_transition(&transition, "request return")
            .await?;

        self.after_transition(&updated, &transition).await;
        Ok(())
    }

    /// Returns an order to its owner.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: OrderId, owner_id: MemberId) -> Result<OrderView> {
        let order = self.load_owned(order_id, owner_id).await?;
        Ok(OrderView::from(&order))
    }

    /// Advances every order that has aged enough in its status by one step.
    ///
    /// Orders changed concurrently by their owner are skipped. Safe to run
    /// alongside user actions and other sweeps.
    #[tracing::instrument(skip(self))]
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for (status, min_age) in self.config.sweep_stages() {
            let due = self
                .orders
                .list_due(status, now - min_age)
                .await
                .map_err(FulfillmentError::transient)?;

            for order in due {
                let Some(transition) = order.scheduled_transition(now, min_age) else {
                    continue;
                };

                match self.orders.compare_and_set_status(&transition).await {
                    Ok(updated) => {
                        self.after_transition(&updated, &transition).await;
                        report.advanced.push(transition);
                    }
                    Err(LedgerError::StaleStatus { actual, .. }) => {
                        tracing::debug!(
                            order_id = %transition.order_id,
                            expected = %transition.from,
                            %actual,
                            "order changed since listed, skipping"
                        );
                        metrics::counter!("order_sweep_stale_total").increment(1);
                        report.stale += 1;
                    }
                    Err(e) => {
                        tracing::warn!(order_id = %transition.order_id, error = %e, "sweep transition failed");
                        report.failed += 1;
                    }
                }
            }
        }

        if !report.advanced.is_empty() || report.stale > 0 {
            tracing::info!(
                advanced = report.advanced.len(),
                stale = report.stale,
                failed = report.failed,
                "lifecycle sweep finished"
            );
        }
        Ok(report)
    }

    async fn find_by_key(&self, owner_id: MemberId, key: &str) -> Result<Option<Order>> {
        self.orders
            .find_by_idempotency_key(owner_id, key)
            .await
            .map_err(FulfillmentError::transient)
    }

    async fn price_lines(&self, items: &[LineItem]) -> Result<Vec<OrderLine>> {
        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let info = self
                .catalog
                .get_product(&item.product_id)
                .await
                .map_err(FulfillmentError::transient)?
                .ok_or_else(|| FulfillmentError::InvalidProduct(item.product_id.clone()))?;

            lines.push(OrderLine::new(
                item.product_id.clone(),
                info.name,
                info.price,
                item.quantity,
            ));
        }
        Ok(lines)
    }

    async fn load_owned(&self, order_id: OrderId, owner_id: MemberId) -> Result<Order> {
        let order = self
            .orders
            .get(order_id)
            .await
            .map_err(FulfillmentError::transient)?
            .ok_or(FulfillmentError::NotFound(order_id))?;

        if !order.is_owned_by(owner_id) {
            return Err(FulfillmentError::Forbidden(order_id));
        }
        Ok(order)
    }

    async fn apply_user_transition(
        &self,
        transition: &StatusTransition,
        action: &'static str,
    ) -> Result<Order> {
        match self.orders.compare_and_set_status(transition).await {
            Ok(order) => Ok(order),
            Err(LedgerError::StaleStatus { actual, .. }) => Err(FulfillmentError::InvalidState {
                current: actual,
                action,
            }),
            Err(LedgerError::IllegalTransition { from, .. }) => Err(FulfillmentError::InvalidState {
                current: from,
                action,
            }),
            Err(LedgerError::NotFound(order_id)) => Err(FulfillmentError::NotFound(order_id)),
            Err(e) => Err(FulfillmentError::transient(e)),
        }
    }

    /// Side effects of a status change that has been stored.
    async fn after_transition(&self, order: &Order, transition: &StatusTransition) {
        tracing::info!(
            order_id = %order.id(),
            from = %transition.from,
            to = %transition.to,
            "order status changed"
        );
        metrics::counter!("order_transitions_total", "to" => transition.to.as_str()).increment(1);

        if transition.to.restores_stock() {
            let reason = match transition.to {
                OrderStatus::ReturnCompleted => ReleaseReason::Returned,
                _ => ReleaseReason::Cancelled,
            };
            let items: Vec<LineItem> = order.lines().iter().map(OrderLine::as_line_item).collect();
            self.coordinator
                .release_all(order.id(), &items, reason)
                .await;
        }

        self.publish_order_event(order, OrderEventType::for_status(transition.to))
            .await;
    }

    async fn publish_order_event(&self, order: &Order, event_type: OrderEventType) {
        let event = OrderEvent {
            event_type,
            order_id: order.id(),
            owner_id: order.owner_id(),
            total_amount: order.total_amount(),
        };

        match event.to_envelope() {
            Ok(envelope) => {
                self.coordinator
                    .publisher()
                    .publish_or_enqueue(envelope)
                    .await;
            }
            Err(e) => {
                tracing::error!(order_id = %order.id(), error = %e, "order event not encodable");
            }
        }
    }
}

fn validate_items(items: &[LineItem]) -> Result<()> {
    if items.is_empty() {
        return Err(FulfillmentError::InvalidRequest(
            "order has no items".to_string(),
        ));
    }
    if let Some(item) = items.iter().find(|item| item.quantity == 0) {
        return Err(FulfillmentError::InvalidRequest(format!(
            "quantity for {} must be greater than 0",
            item.product_id
        )));
    }
    Ok(())
}

fn reservation_error(failure: &ReservationFailure) -> FulfillmentError {
    match failure {
        ReservationFailure::InsufficientStock { product_id } => {
            FulfillmentError::InsufficientStock {
                product_id: product_id.clone(),
            }
        }
        ReservationFailure::UnknownProduct { product_id } => {
            FulfillmentError::InvalidProduct(product_id.clone())
        }
        ReservationFailure::Transient { message, .. } => FulfillmentError::transient(message),
    }
}
