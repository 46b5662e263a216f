//! Applies the follow-up effects of stock and order events.
//!
//! Delivery is at-least-once, so every effect here is idempotent: stock
//! adjustments carry a dedupe key and payment entries are unique per order
//! and kind. A message that fails is not committed and comes back on the next
//! poll; its partition waits behind it so per-key order holds.

use std::collections::HashMap;
use std::time::Duration;

use domain::{ChannelMessage, OrderEvent, OrderEventType, StockEvent};
use event_channel::{Delivery, EventChannel, EventEnvelope};
use stock::{AdjustmentOutcome, InventoryTable};
use tokio::sync::{Mutex, watch};

use crate::error::ListenerError;
use crate::payment::{PaymentEntry, PaymentHistory, PaymentKind};

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Consumer name offsets are committed under.
    pub consumer: String,
    /// Pause between polls.
    pub poll_interval: Duration,
    /// Consecutive failures of one message before it is reported as stuck.
    pub stuck_threshold: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            consumer: "compensation-listener".to_string(),
            poll_interval: Duration::from_millis(500),
            stuck_threshold: 5,
        }
    }
}

/// A message that keeps failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub event_type: String,
    pub failures: u32,
    pub last_error: String,
}

type Position = (String, u32, u64);

/// Consumes `stock-events` and `order-events`.
pub struct CompensationListener<C, I, P>
where
    C: EventChannel,
    I: InventoryTable,
    P: PaymentHistory,
{
    channel: C,
    inventory: I,
    payments: P,
    config: ListenerConfig,
    failures: Mutex<HashMap<Position, StuckMessage>>,
}

impl<C, I, P> CompensationListener<C, I, P>
where
    C: EventChannel,
    I: InventoryTable,
    P: PaymentHistory,
{
    pub fn new(channel: C, inventory: I, payments: P) -> Self {
        Self::with_config(channel, inventory, payments, ListenerConfig::default())
    }

    pub fn with_config(channel: C, inventory: I, payments: P, config: ListenerConfig) -> Self {
        Self {
            channel,
            inventory,
            payments,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Applies one message.
    #[tracing::instrument(skip(self, envelope), fields(topic = %envelope.topic, event_type = %envelope.event_type))]
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ListenerError> {
        let topic = envelope.topic.as_str();
        if topic == StockEvent::TOPIC {
            self.handle_stock(&StockEvent::from_envelope(envelope)?).await
        } else if topic == OrderEvent::TOPIC {
            self.handle_order(&OrderEvent::from_envelope(envelope)?, envelope)
                .await
        } else {
            Err(ListenerError::UnexpectedTopic(topic.to_string()))
        }
    }

    async fn handle_stock(&self, event: &StockEvent) -> Result<(), ListenerError> {
        let outcome = self
            .inventory
            .apply_adjustment(
                &event.product_id,
                event.event_type.signed(event.quantity),
                &event.dedupe_key(),
            )
            .await?;

        match outcome {
            AdjustmentOutcome::Applied(quantity) => {
                metrics::counter!("listener_events_applied_total", "topic" => StockEvent::TOPIC)
                    .increment(1);
                tracing::info!(
                    product_id = %event.product_id,
                    order_id = %event.order_id,
                    quantity,
                    "inventory adjusted"
                );
            }
            AdjustmentOutcome::AlreadyApplied => {
                metrics::counter!("listener_duplicates_total").increment(1);
                tracing::debug!(dedupe_key = %event.dedupe_key(), "stock event already applied");
            }
        }
        Ok(())
    }

    async fn handle_order(
        &self,
        event: &OrderEvent,
        envelope: &EventEnvelope,
    ) -> Result<(), ListenerError> {
        let kind = match event.event_type {
            OrderEventType::OrderCreated => PaymentKind::Settled,
            OrderEventType::OrderCancelled | OrderEventType::ReturnCompleted => {
                PaymentKind::Refunded
            }
            OrderEventType::DeliveryStarted
            | OrderEventType::DeliveryCompleted
            | OrderEventType::ReturnRequested => {
                tracing::info!(
                    order_id = %event.order_id,
                    owner_id = %event.owner_id,
                    event_type = event.event_type.as_str(),
                    "owner notified"
                );
                return Ok(());
            }
        };

        let recorded = self
            .payments
            .record(PaymentEntry {
                order_id: event.order_id,
                owner_id: event.owner_id,
                kind,
                amount: event.total_amount,
                recorded_at: envelope.emitted_at,
            })
            .await?;

        if recorded {
            metrics::counter!("listener_events_applied_total", "topic" => OrderEvent::TOPIC)
                .increment(1);
            tracing::info!(order_id = %event.order_id, kind = kind.as_str(), amount = %event.total_amount, "payment recorded");
        } else {
            metrics::counter!("listener_duplicates_total").increment(1);
            tracing::debug!(order_id = %event.order_id, kind = kind.as_str(), "payment already recorded");
        }
        Ok(())
    }

    /// Fetches and applies the next message of every partition of both
    /// topics, committing each one that succeeds.
    ///
    /// Returns how many messages were committed.
    pub async fn poll_once(&self) -> Result<usize, ListenerError> {
        let mut committed = 0;

        for topic in [StockEvent::TOPIC, OrderEvent::TOPIC] {
            let deliveries = self.channel.fetch(topic, &self.config.consumer).await?;

            for delivery in deliveries {
                match self.handle(&delivery.envelope).await {
                    Ok(()) => {
                        self.channel.commit(&self.config.consumer, &delivery).await?;
                        self.clear_failure(&delivery).await;
                        committed += 1;
                    }
                    Err(e) => self.record_failure(&delivery, &e).await,
                }
            }
        }

        Ok(committed)
    }

    /// Polls until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = %self.config.consumer, "compensation listener started");

        while !*shutdown.borrow() {
            match self.poll_once().await {
                // Keep draining while there is work.
                Ok(committed) if committed > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "listener poll failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(consumer = %self.config.consumer, "compensation listener stopped");
    }

    /// Number of `stock-events` partitions holding messages this listener has
    /// not committed yet, stuck ones included.
    ///
    /// Zero means every published stock event has reached the inventory table.
    pub async fn pending_stock_events(&self) -> Result<usize, ListenerError> {
        let heads = self
            .channel
            .fetch(StockEvent::TOPIC, &self.config.consumer)
            .await?;
        Ok(heads.len())
    }

    /// Messages that failed at least `stuck_threshold` times in a row.
    pub async fn stuck_messages(&self) -> Vec<StuckMessage> {
        let mut stuck: Vec<_> = self
            .failures
            .lock()
            .await
            .values()
            .filter(|m| m.failures >= self.config.stuck_threshold)
            .cloned()
            .collect();
        stuck.sort_by(|a, b| {
            (&a.topic, a.partition, a.offset).cmp(&(&b.topic, b.partition, b.offset))
        });
        stuck
    }

    async fn record_failure(&self, delivery: &Delivery, error: &ListenerError) {
        metrics::counter!("listener_failures_total").increment(1);

        let mut failures = self.failures.lock().await;
        let entry = failures
            .entry(delivery.position())
            .or_insert_with(|| StuckMessage {
                topic: delivery.envelope.topic.clone(),
                partition: delivery.partition,
                offset: delivery.offset,
                event_type: delivery.envelope.event_type.clone(),
                failures: 0,
                last_error: String::new(),
            });
        entry.failures += 1;
        entry.last_error = error.to_string();

        if entry.failures == self.config.stuck_threshold {
            tracing::error!(
                topic = %entry.topic,
                partition = entry.partition,
                offset = entry.offset,
                event_type = %entry.event_type,
                failures = entry.failures,
                error = %error,
                "message is stuck; its partition is blocked until it succeeds"
            );
        } else {
            tracing::warn!(
                topic = %entry.topic,
                partition = entry.partition,
                offset = entry.offset,
                failures = entry.failures,
                error = %error,
                "message failed, left for redelivery"
            );
        }

        let threshold = self.config.stuck_threshold;
        let stuck = failures.values().filter(|m| m.failures >= threshold).count();
        metrics::gauge!("listener_stuck_messages").set(stuck as f64);
    }

    async fn clear_failure(&self, delivery: &Delivery) {
        let mut failures = self.failures.lock().await;
        if failures.remove(&delivery.position()).is_some() {
            let threshold = self.config.stuck_threshold;
            let stuck = failures.values().filter(|m| m.failures >= threshold).count();
            metrics::gauge!("listener_stuck_messages").set(stuck as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MemberId, OrderId, ProductId};
    use domain::Money;
    use event_channel::InMemoryEventChannel;
    use stock::InMemoryInventoryTable;

    use crate::payment::InMemoryPaymentHistory;

    type TestListener =
        CompensationListener<InMemoryEventChannel, InMemoryInventoryTable, InMemoryPaymentHistory>;

    async fn setup() -> (TestListener, InMemoryEventChannel, InMemoryInventoryTable, InMemoryPaymentHistory) {
        let channel = InMemoryEventChannel::new();
        let inventory = InMemoryInventoryTable::new();
        inventory.seed(&ProductId::new("SKU-1"), 10).await.unwrap();
        let payments = InMemoryPaymentHistory::new();
        let listener = CompensationListener::with_config(
            channel.clone(),
            inventory.clone(),
            payments.clone(),
            ListenerConfig {
                stuck_threshold: 2,
                ..Default::default()
            },
        );
        (listener, channel, inventory, payments)
    }

    #[tokio::test]
    async fn test_duplicate_stock_reduced_applies_once() {
        let (listener, _, inventory, _) = setup().await;
        let envelope = StockEvent::reduced(OrderId::new(), ProductId::new("SKU-1"), 3)
            .to_envelope()
            .unwrap();

        listener.handle(&envelope).await.unwrap();
        listener.handle(&envelope).await.unwrap();

        assert_eq!(
            inventory.quantity(&ProductId::new("SKU-1")).await.unwrap(),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_order_events_update_payment_history() {
        let (listener, _, _, payments) = setup().await;
        let order_id = OrderId::new();
        let event = |event_type| OrderEvent {
            event_type,
            order_id,
            owner_id: MemberId::new(),
            total_amount: Money::from_cents(1200),
        };

        for event_type in [
            OrderEventType::OrderCreated,
            OrderEventType::OrderCreated,
            OrderEventType::DeliveryStarted,
            OrderEventType::OrderCancelled,
        ] {
            listener
                .handle(&event(event_type).to_envelope().unwrap())
                .await
                .unwrap();
        }

        let kinds: Vec<_> = payments
            .entries_for(order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![PaymentKind::Settled, PaymentKind::Refunded]);
    }

    #[tokio::test]
    async fn test_poll_commits_processed_messages() {
        let (listener, channel, inventory, _) = setup().await;
        let event = StockEvent::reduced(OrderId::new(), ProductId::new("SKU-1"), 2);
        channel.publish(event.to_envelope().unwrap()).await.unwrap();

        assert_eq!(listener.poll_once().await.unwrap(), 1);
        assert_eq!(listener.poll_once().await.unwrap(), 0);

        // Redelivery after a lost commit is absorbed.
        channel.rewind(StockEvent::TOPIC, "compensation-listener").await;
        assert_eq!(listener.poll_once().await.unwrap(), 1);
        assert_eq!(
            inventory.quantity(&ProductId::new("SKU-1")).await.unwrap(),
            Some(8)
        );
    }

    #[tokio::test]
    async fn test_failing_message_is_redelivered_then_reported_stuck() {
        let (listener, channel, inventory, _) = setup().await;
        let event = StockEvent::reduced(OrderId::new(), ProductId::new("SKU-1"), 1);
        channel.publish(event.to_envelope().unwrap()).await.unwrap();

        inventory.set_unavailable(true);
        assert_eq!(listener.poll_once().await.unwrap(), 0);
        assert!(listener.stuck_messages().await.is_empty());
        assert_eq!(listener.poll_once().await.unwrap(), 0);

        let stuck = listener.stuck_messages().await;
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].event_type, "STOCK_REDUCED");
        assert_eq!(stuck[0].failures, 2);

        inventory.set_unavailable(false);
        assert_eq!(listener.poll_once().await.unwrap(), 1);
        assert!(listener.stuck_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_stock_events_counts_uncommitted_messages() {
        let (listener, channel, inventory, _) = setup().await;
        assert_eq!(listener.pending_stock_events().await.unwrap(), 0);

        let event = StockEvent::reduced(OrderId::new(), ProductId::new("SKU-1"), 1);
        channel.publish(event.to_envelope().unwrap()).await.unwrap();
        assert_eq!(listener.pending_stock_events().await.unwrap(), 1);

        // A stuck message still counts.
        inventory.set_unavailable(true);
        listener.poll_once().await.unwrap();
        listener.poll_once().await.unwrap();
        assert_eq!(listener.stuck_messages().await.len(), 1);
        assert_eq!(listener.pending_stock_events().await.unwrap(), 1);

        inventory.set_unavailable(false);
        listener.poll_once().await.unwrap();
        assert_eq!(listener.pending_stock_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_rejected() {
        let (listener, _, _, _) = setup().await;
        let envelope = EventEnvelope::builder()
            .topic("audit-events")
            .key("k")
            .event_type("SOMETHING")
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap();

        assert!(matches!(
            listener.handle(&envelope).await,
            Err(ListenerError::UnexpectedTopic(_))
        ));
    }
}
