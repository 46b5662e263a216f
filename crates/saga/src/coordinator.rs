//! Reserves stock for every line of an order, all or nothing.

use std::time::Duration;

use common::{OrderId, ProductId};
use domain::{ChannelMessage, LineItem, StockEvent};
use event_channel::{EventChannel, ReliablePublisher};
use stock::{StockError, StockLedger};

use crate::reservation::{LineOutcome, ReservationAttempt, ReservationFailure};

/// Retry behaviour for transient stock failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra tries for a line after a transient failure during reservation.
    pub reserve_retries: u32,
    /// Extra tries for each release during compensation or cancellation.
    pub release_retries: u32,
    /// Delay before a retry; doubled on each further retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reserve_retries: 1,
            release_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Why stock is being given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Owner cancelled before delivery.
    Cancelled,
    /// A return was completed.
    Returned,
    /// The order could not be persisted after a successful reservation.
    PersistenceFailed,
}

impl ReleaseReason {
    /// Only orders that were confirmed had `STOCK_REDUCED` emitted, so only
    /// they get a matching `STOCK_RESTORED`.
    fn emits_restored(&self) -> bool {
        !matches!(self, ReleaseReason::PersistenceFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Cancelled => "cancelled",
            ReleaseReason::Returned => "returned",
            ReleaseReason::PersistenceFailed => "persistence_failed",
        }
    }
}

/// What `release_all` managed to give back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: Vec<ProductId>,
    /// Products whose counter could not be updated; left for reconciliation.
    pub failed: Vec<ProductId>,
}

/// Takes stock for a set of line items against a [`StockLedger`] and
/// announces confirmed and restored stock on the event channel.
///
/// Products are always locked in ascending id order so two attempts sharing
/// products cannot wait on each other in a cycle.
pub struct StockReservationCoordinator<S, C>
where
    S: StockLedger,
    C: EventChannel,
{
    ledger: S,
    publisher: ReliablePublisher<C>,
    retry: RetryPolicy,
}

impl<S, C> StockReservationCoordinator<S, C>
where
    S: StockLedger,
    C: EventChannel,
{
    /// Creates a coordinator with the default retry policy.
    pub fn new(ledger: S, publisher: ReliablePublisher<C>) -> Self {
        Self::with_retry(ledger, publisher, RetryPolicy::default())
    }

    /// Creates a coordinator with an explicit retry policy.
    pub fn with_retry(ledger: S, publisher: ReliablePublisher<C>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            publisher,
            retry,
        }
    }

    pub fn ledger(&self) -> &S {
        &self.ledger
    }

    pub fn publisher(&self) -> &ReliablePublisher<C> {
        &self.publisher
    }

    /// Reserves every item or none.
    ///
    /// Items are merged per product and sorted first. On the first failure the
    /// lines already reserved are released in reverse order before returning
    /// the failed attempt.
    #[tracing::instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn reserve_all(&self, items: &[LineItem]) -> ReservationAttempt {
        let mut attempt = ReservationAttempt::start(LineItem::normalize(items));

        let mut failure = None;
        for index in 0..attempt.lines().len() {
            let item = attempt.lines()[index].item.clone();
            match self.reserve_line(&item).await {
                Ok(()) => attempt.mark(index, LineOutcome::Reserved),
                Err(reason) => {
                    attempt.mark(index, LineOutcome::Failed);
                    failure = Some(reason);
                    break;
                }
            }
        }

        let Some(failure) = failure else {
            attempt.succeed();
            metrics::counter!("stock_reservations_total", "outcome" => "reserved").increment(1);
            return attempt;
        };

        metrics::counter!("stock_reservations_total", "outcome" => failure.outcome())
            .increment(1);
        tracing::warn!(
            product_id = %failure.product_id(),
            outcome = failure.outcome(),
            "reservation failed, compensating"
        );
        self.compensate(&mut attempt).await;
        attempt.fail(failure);
        attempt
    }

    async fn reserve_line(&self, item: &LineItem) -> Result<(), ReservationFailure> {
        let mut retries_left = self.retry.reserve_retries;
        let mut delay = self.retry.backoff;

        loop {
            match self
                .ledger
                .try_reserve(&item.product_id, item.quantity)
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    return Err(ReservationFailure::InsufficientStock {
                        product_id: item.product_id.clone(),
                    });
                }
                Err(StockError::UnknownProduct(product_id)) => {
                    return Err(ReservationFailure::UnknownProduct { product_id });
                }
                Err(e) if e.is_transient() && retries_left > 0 => {
                    tracing::debug!(product_id = %item.product_id, error = %e, "retrying reservation");
                    retries_left -= 1;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    return Err(ReservationFailure::Transient {
                        product_id: item.product_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Releases reserved lines in reverse order.
    async fn compensate(&self, attempt: &mut ReservationAttempt) {
        for index in attempt.reserved_indexes().into_iter().rev() {
            let item = attempt.lines()[index].item.clone();
            match self.release_line(&item).await {
                Ok(()) => {
                    attempt.mark(index, LineOutcome::Released);
                    metrics::counter!("stock_compensations_total").increment(1);
                }
                Err(e) => {
                    tracing::error!(
                        product_id = %item.product_id,
                        quantity = item.quantity,
                        error = %e,
                        "compensation release failed; left for reconciliation"
                    );
                }
            }
        }
    }

    async fn release_line(&self, item: &LineItem) -> Result<(), StockError> {
        let mut retries_left = self.retry.release_retries;
        let mut delay = self.retry.backoff;

        loop {
            match self.ledger.release(&item.product_id, item.quantity).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && retries_left > 0 => {
                    retries_left -= 1;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Announces a persisted order's reservation with one `STOCK_REDUCED`
    /// per line.
    #[tracing::instrument(skip(self, attempt), fields(attempt_id = %attempt.attempt_id()))]
    pub async fn confirm(&self, order_id: OrderId, attempt: &ReservationAttempt) {
        for item in attempt.reserved_items() {
            let event = StockEvent::reduced(order_id, item.product_id, item.quantity);
            self.emit(&event).await;
        }
    }

    /// Gives back every item, whatever its earlier state.
    ///
    /// Emits `STOCK_RESTORED` per item unless the order was never persisted.
    /// A release that keeps failing is logged and left for reconciliation;
    /// the restored event is still emitted so the inventory table stays right.
    #[tracing::instrument(skip(self, items), fields(reason = reason.as_str()))]
    pub async fn release_all(
        &self,
        order_id: OrderId,
        items: &[LineItem],
        reason: ReleaseReason,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for item in LineItem::normalize(items) {
            match self.release_line(&item).await {
                Ok(()) => report.released.push(item.product_id.clone()),
                Err(e) => {
                    tracing::error!(
                        %order_id,
                        product_id = %item.product_id,
                        quantity = item.quantity,
                        error = %e,
                        "stock release failed; left for reconciliation"
                    );
                    report.failed.push(item.product_id.clone());
                }
            }

            if reason.emits_restored() {
                let event = StockEvent::restored(order_id, item.product_id, item.quantity);
                self.emit(&event).await;
            }
        }

        report
    }

    async fn emit(&self, event: &StockEvent) {
        match event.to_envelope() {
            Ok(envelope) => {
                self.publisher.publish_or_enqueue(envelope).await;
            }
            Err(e) => {
                tracing::error!(error = %e, event_type = event.event_type.as_str(), "stock event not encodable");
            }
        }
    }
}
