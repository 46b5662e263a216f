//! Messages the fulfillment flow publishes on the event channel.

use common::{MemberId, OrderId, ProductId};
use event_channel::{ChannelError, EventEnvelope};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::order::{Money, OrderStatus};

/// A typed message that knows its topic and partitioning key.
///
/// Messages are facts that have already happened and are named in past tense.
pub trait ChannelMessage: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Topic every message of this type is published to.
    const TOPIC: &'static str;

    /// Returns the event type name carried in the envelope.
    fn event_type(&self) -> &'static str;

    /// Partitioning key; messages sharing it are delivered in order.
    fn key(&self) -> String;

    /// The order this message is about.
    fn correlation_id(&self) -> String;

    /// Wraps the message in an envelope ready to publish.
    fn to_envelope(&self) -> Result<EventEnvelope, ChannelError> {
        EventEnvelope::builder()
            .topic(Self::TOPIC)
            .key(self.key())
            .event_type(self.event_type())
            .correlation_id(self.correlation_id())
            .payload(self)?
            .build()
    }

    /// Decodes a message from a delivered envelope.
    fn from_envelope(envelope: &EventEnvelope) -> Result<Self, ChannelError> {
        envelope.decode()
    }
}

/// What happened to a product's stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockEventType {
    /// A reservation for a persisted order was confirmed.
    StockReduced,
    /// Stock of a cancelled or returned order was given back.
    StockRestored,
}

impl StockEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockEventType::StockReduced => "STOCK_REDUCED",
            StockEventType::StockRestored => "STOCK_RESTORED",
        }
    }

    /// Signed change to apply to the authoritative quantity.
    pub fn signed(&self, quantity: u32) -> i64 {
        match self {
            StockEventType::StockReduced => -i64::from(quantity),
            StockEventType::StockRestored => i64::from(quantity),
        }
    }
}

/// Stock change for one product of one order, keyed by product id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEvent {
    pub event_type: StockEventType,
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: OrderId,
}

impl StockEvent {
    pub fn reduced(order_id: OrderId, product_id: ProductId, quantity: u32) -> Self {
        Self {
            event_type: StockEventType::StockReduced,
            product_id,
            quantity,
            order_id,
        }
    }

    pub fn restored(order_id: OrderId, product_id: ProductId, quantity: u32) -> Self {
        Self {
            event_type: StockEventType::StockRestored,
            product_id,
            quantity,
            order_id,
        }
    }

    /// Identifies this adjustment across redeliveries.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.event_type.as_str(),
            self.order_id,
            self.product_id
        )
    }
}

impl ChannelMessage for StockEvent {
    const TOPIC: &'static str = "stock-events";

    fn event_type(&self) -> &'static str {
        self.event_type.as_str()
    }

    fn key(&self) -> String {
        self.product_id.to_string()
    }

    fn correlation_id(&self) -> String {
        self.order_id.to_string()
    }
}

/// Order lifecycle milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventType {
    OrderCreated,
    OrderCancelled,
    DeliveryStarted,
    DeliveryCompleted,
    ReturnRequested,
    ReturnCompleted,
}

impl OrderEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventType::OrderCreated => "ORDER_CREATED",
            OrderEventType::OrderCancelled => "ORDER_CANCELLED",
            OrderEventType::DeliveryStarted => "DELIVERY_STARTED",
            OrderEventType::DeliveryCompleted => "DELIVERY_COMPLETED",
            OrderEventType::ReturnRequested => "RETURN_REQUESTED",
            OrderEventType::ReturnCompleted => "RETURN_COMPLETED",
        }
    }

    /// The event announcing that an order entered `status`.
    pub fn for_status(status: OrderStatus) -> Self {
        match status {
            OrderStatus::OrderReceived => OrderEventType::OrderCreated,
            OrderStatus::Delivering => OrderEventType::DeliveryStarted,
            OrderStatus::DeliveryCompleted => OrderEventType::DeliveryCompleted,
            OrderStatus::Cancelled => OrderEventType::OrderCancelled,
            OrderStatus::ReturnRequested => OrderEventType::ReturnRequested,
            OrderStatus::ReturnCompleted => OrderEventType::ReturnCompleted,
        }
    }
}

/// Order milestone, keyed by order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub event_type: OrderEventType,
    pub order_id: OrderId,
    pub owner_id: MemberId,
    pub total_amount: Money,
}

impl ChannelMessage for OrderEvent {
    const TOPIC: &'static str = "order-events";

    fn event_type(&self) -> &'static str {
        self.event_type.as_str()
    }

    fn key(&self) -> String {
        self.order_id.to_string()
    }

    fn correlation_id(&self) -> String {
        self.order_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_event_envelope_routing() {
        let order_id = OrderId::new();
        let event = StockEvent::reduced(order_id, ProductId::new("SKU-001"), 3);
        let envelope = event.to_envelope().unwrap();

        assert_eq!(envelope.topic, "stock-events");
        assert_eq!(envelope.key, "SKU-001");
        assert_eq!(envelope.event_type, "STOCK_REDUCED");
        assert_eq!(envelope.correlation_id, order_id.to_string());
        assert_eq!(envelope.payload["event_type"], "STOCK_REDUCED");

        let decoded = StockEvent::from_envelope(&envelope).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_dedupe_key_distinguishes_products_and_types() {
        let order_id = OrderId::new();
        let a = StockEvent::reduced(order_id, ProductId::new("SKU-001"), 1);
        let b = StockEvent::reduced(order_id, ProductId::new("SKU-002"), 1);
        let c = StockEvent::restored(order_id, ProductId::new("SKU-001"), 1);

        assert_ne!(a.dedupe_key(), b.dedupe_key());
        assert_ne!(a.dedupe_key(), c.dedupe_key());
        assert_eq!(a.dedupe_key(), a.clone().dedupe_key());
    }

    #[test]
    fn test_signed_quantity() {
        assert_eq!(StockEventType::StockReduced.signed(4), -4);
        assert_eq!(StockEventType::StockRestored.signed(4), 4);
    }

    #[test]
    fn test_order_event_keyed_by_order() {
        let event = OrderEvent {
            event_type: OrderEventType::for_status(OrderStatus::Cancelled),
            order_id: OrderId::new(),
            owner_id: MemberId::new(),
            total_amount: Money::from_cents(500),
        };
        let envelope = event.to_envelope().unwrap();
        assert_eq!(envelope.topic, "order-events");
        assert_eq!(envelope.key, event.order_id.to_string());
        assert_eq!(envelope.event_type, "ORDER_CANCELLED");
    }
}
