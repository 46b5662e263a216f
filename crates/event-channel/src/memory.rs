use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    ChannelError, EventEnvelope, Result,
    channel::{Delivery, EventChannel, PublishAck, partition_for},
};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 8;

#[derive(Default)]
struct ChannelState {
    /// topic -> partition -> log
    topics: HashMap<String, Vec<Vec<EventEnvelope>>>,
    /// (consumer, topic, partition) -> next offset to deliver
    offsets: HashMap<(String, String, u32), u64>,
    unavailable: bool,
}

/// In-memory event channel for tests and single-node deployments.
///
/// Provides the same per-key ordering and at-least-once contract as the
/// PostgreSQL implementation.
#[derive(Clone)]
pub struct InMemoryEventChannel {
    state: Arc<RwLock<ChannelState>>,
    partitions: u32,
}

impl InMemoryEventChannel {
    /// Creates a channel with [`DEFAULT_PARTITIONS`] partitions per topic.
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a channel with the given number of partitions per topic.
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(ChannelState::default())),
            partitions: partitions.max(1),
        }
    }

    /// Makes every publish and fetch fail as if the broker were down.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Returns every message published to `topic`, in partition order.
    pub async fn messages(&self, topic: &str) -> Vec<EventEnvelope> {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the total number of messages on `topic`.
    pub async fn message_count(&self, topic: &str) -> usize {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Rewinds a consumer to the start of `topic`, so every message is
    /// delivered again.
    pub async fn rewind(&self, topic: &str, consumer: &str) {
        let mut state = self.state.write().await;
        state
            .offsets
            .retain(|(c, t, _), _| !(c == consumer && t == topic));
    }
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishAck> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(ChannelError::Unavailable("broker unreachable".to_string()));
        }

        let partition = partition_for(&envelope.key, self.partitions);
        let topic = envelope.topic.clone();
        let log = state
            .topics
            .entry(topic.clone())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        let partition_log = &mut log[partition as usize];
        let offset = partition_log.len() as u64;
        partition_log.push(envelope);

        Ok(PublishAck {
            topic,
            partition,
            offset,
        })
    }

    async fn fetch(&self, topic: &str, consumer: &str) -> Result<Vec<Delivery>> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(ChannelError::Unavailable("broker unreachable".to_string()));
        }

        let Some(partitions) = state.topics.get(topic) else {
            return Ok(Vec::new());
        };

        let mut deliveries = Vec::new();
        for (partition, log) in partitions.iter().enumerate() {
            let partition = partition as u32;
            let next = state
                .offsets
                .get(&(consumer.to_string(), topic.to_string(), partition))
                .copied()
                .unwrap_or(0);
            if let Some(envelope) = log.get(next as usize) {
                deliveries.push(Delivery {
                    envelope: envelope.clone(),
                    partition,
                    offset: next,
                });
            }
        }
        Ok(deliveries)
    }

    async fn commit(&self, consumer: &str, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(ChannelError::Unavailable("broker unreachable".to_string()));
        }

        let next = state
            .offsets
            .entry((
                consumer.to_string(),
                delivery.envelope.topic.clone(),
                delivery.partition,
            ))
            .or_insert(0);
        *next = (*next).max(delivery.offset + 1);
        Ok(())
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventChannelExt;

    fn message(key: &str, event_type: &str, seq: u32) -> EventEnvelope {
        EventEnvelope::builder()
            .topic("stock-events")
            .key(key)
            .event_type(event_type)
            .payload_raw(serde_json::json!({ "seq": seq }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn publish_assigns_sequential_offsets_per_partition() {
        let channel = InMemoryEventChannel::with_partitions(4);

        let a1 = channel.publish(message("SKU-1", "STOCK_REDUCED", 1)).await.unwrap();
        let a2 = channel.publish(message("SKU-1", "STOCK_REDUCED", 2)).await.unwrap();

        assert_eq!(a1.partition, a2.partition);
        assert_eq!(a1.offset, 0);
        assert_eq!(a2.offset, 1);
        assert_eq!(channel.message_count("stock-events").await, 2);
    }

    #[tokio::test]
    async fn uncommitted_delivery_is_redelivered() {
        let channel = InMemoryEventChannel::with_partitions(1);
        channel.publish(message("SKU-1", "STOCK_REDUCED", 1)).await.unwrap();

        let first = channel.fetch("stock-events", "listener").await.unwrap();
        let again = channel.fetch("stock-events", "listener").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, again);

        channel.commit("listener", &first[0]).await.unwrap();
        assert!(channel.fetch("stock-events", "listener").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn per_key_order_is_preserved() {
        let channel = InMemoryEventChannel::with_partitions(2);
        for seq in 0..5 {
            channel.publish(message("SKU-7", "STOCK_REDUCED", seq)).await.unwrap();
        }

        let mut sub = channel.subscribe("stock-events", "listener");
        let mut seen = Vec::new();
        while let Some(delivery) = sub.next().await.unwrap() {
            seen.push(delivery.envelope.payload["seq"].as_u64().unwrap());
            sub.ack(&delivery).await.unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn consumers_track_offsets_independently() {
        let channel = InMemoryEventChannel::with_partitions(1);
        channel.publish(message("SKU-1", "STOCK_REDUCED", 1)).await.unwrap();

        let delivery = channel.fetch("stock-events", "a").await.unwrap().remove(0);
        channel.commit("a", &delivery).await.unwrap();

        assert!(channel.fetch("stock-events", "a").await.unwrap().is_empty());
        assert_eq!(channel.fetch("stock-events", "b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_commit_does_not_move_offset_backwards() {
        let channel = InMemoryEventChannel::with_partitions(1);
        channel.publish(message("SKU-1", "STOCK_REDUCED", 1)).await.unwrap();
        channel.publish(message("SKU-1", "STOCK_REDUCED", 2)).await.unwrap();

        let first = channel.fetch("stock-events", "c").await.unwrap().remove(0);
        channel.commit("c", &first).await.unwrap();
        let second = channel.fetch("stock-events", "c").await.unwrap().remove(0);
        channel.commit("c", &second).await.unwrap();
        channel.commit("c", &first).await.unwrap();

        assert!(channel.fetch("stock-events", "c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewind_replays_everything() {
        let channel = InMemoryEventChannel::with_partitions(1);
        channel.publish(message("SKU-1", "STOCK_REDUCED", 1)).await.unwrap();
        let d = channel.fetch("stock-events", "c").await.unwrap().remove(0);
        channel.commit("c", &d).await.unwrap();

        channel.rewind("stock-events", "c").await;
        assert_eq!(channel.fetch("stock-events", "c").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_channel_rejects_publish() {
        let channel = InMemoryEventChannel::new();
        channel.set_unavailable(true).await;

        let result = channel.publish(message("SKU-1", "STOCK_REDUCED", 1)).await;
        assert!(matches!(result, Err(ChannelError::Unavailable(_))));
        assert_eq!(channel.message_count("stock-events").await, 0);
    }
}
