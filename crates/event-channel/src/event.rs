use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChannelError;

/// Unique identifier for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A message on the channel together with its routing information.
///
/// `key` selects the partition and therefore the ordering domain: two
/// envelopes with the same topic and key are always delivered in publish
/// order. `correlation_id` plus `event_type` is what consumers de-duplicate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this message.
    pub event_id: EventId,

    /// The topic the message is published to (e.g., "stock-events").
    pub topic: String,

    /// Partitioning key (product id for stock events, order id for order events).
    pub key: String,

    /// The type of the event (e.g., "STOCK_REDUCED").
    pub event_type: String,

    /// The order or product this message is about.
    pub correlation_id: String,

    /// When the message was emitted.
    pub emitted_at: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the message.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns the key consumers use to recognise a redelivered message.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.event_type, self.correlation_id)
    }

    /// Deserializes the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ChannelError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    topic: Option<String>,
    key: Option<String>,
    event_type: Option<String>,
    correlation_id: Option<String>,
    emitted_at: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the topic.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Sets the partitioning key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the correlation ID.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the emission time. If not set, the current time will be used.
    pub fn emitted_at(mut self, emitted_at: DateTime<Utc>) -> Self {
        self.emitted_at = Some(emitted_at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the envelope.
    ///
    /// The correlation ID defaults to the key when not set explicitly.
    pub fn build(self) -> Result<EventEnvelope, ChannelError> {
        let key = self.key.ok_or(ChannelError::MissingField("key"))?;
        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            topic: self.topic.ok_or(ChannelError::MissingField("topic"))?,
            event_type: self
                .event_type
                .ok_or(ChannelError::MissingField("event_type"))?,
            correlation_id: self.correlation_id.unwrap_or_else(|| key.clone()),
            key,
            emitted_at: self.emitted_at.unwrap_or_else(Utc::now),
            payload: self.payload.ok_or(ChannelError::MissingField("payload"))?,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_creates_unique_ids() {
        let id1 = EventId::new();
        let id2 = EventId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn builder_sets_all_fields() {
        let payload = serde_json::json!({"quantity": 3});

        let envelope = EventEnvelope::builder()
            .topic("stock-events")
            .key("SKU-001")
            .event_type("STOCK_REDUCED")
            .correlation_id("order-1")
            .payload_raw(payload.clone())
            .metadata("source", serde_json::json!("test"))
            .build()
            .unwrap();

        assert_eq!(envelope.topic, "stock-events");
        assert_eq!(envelope.key, "SKU-001");
        assert_eq!(envelope.event_type, "STOCK_REDUCED");
        assert_eq!(envelope.correlation_id, "order-1");
        assert_eq!(envelope.payload, payload);
        assert_eq!(
            envelope.metadata.get("source"),
            Some(&serde_json::json!("test"))
        );
    }

    #[test]
    fn correlation_id_defaults_to_key() {
        let envelope = EventEnvelope::builder()
            .topic("order-events")
            .key("order-9")
            .event_type("ORDER_CREATED")
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap();

        assert_eq!(envelope.correlation_id, "order-9");
        assert_eq!(envelope.dedupe_key(), "ORDER_CREATED:order-9");
    }

    #[test]
    fn build_reports_missing_field() {
        let result = EventEnvelope::builder().key("k").build();
        assert!(matches!(result, Err(ChannelError::MissingField("topic"))));
    }
}
