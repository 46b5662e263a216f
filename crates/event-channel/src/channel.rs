use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{EventEnvelope, Result};

/// Acknowledgement returned by the broker for a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    /// Topic the message was written to.
    pub topic: String,
    /// Partition chosen from the message key.
    pub partition: u32,
    /// Position of the message within its partition.
    pub offset: u64,
}

/// A message handed to a consumer, with the position needed to commit it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub partition: u32,
    pub offset: u64,
}

impl Delivery {
    /// Identifies this exact message position, stable across redeliveries.
    pub fn position(&self) -> (String, u32, u64) {
        (self.envelope.topic.clone(), self.partition, self.offset)
    }
}

/// Maps a key onto one of `partitions` partitions.
///
/// Uses 32-bit FNV-1a so the mapping is stable across processes and
/// releases; persisted partitions depend on it.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    });
    hash % partitions.max(1)
}

/// Core trait for event channel implementations.
///
/// A channel is a partitioned, append-only log per topic. Messages with the
/// same key land in the same partition and are delivered in publish order.
/// Delivery is at-least-once: a consumer's position in a partition only
/// advances when it commits, so anything fetched but not committed is handed
/// out again on the next fetch.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Appends a message to its topic and returns the broker acknowledgement.
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishAck>;

    /// Returns, for each partition of `topic`, the oldest message the
    /// consumer has not yet committed.
    ///
    /// At most one message per partition is returned, which keeps per-key
    /// ordering intact even when a consumer fails part of a batch.
    async fn fetch(&self, topic: &str, consumer: &str) -> Result<Vec<Delivery>>;

    /// Marks a delivery as processed by `consumer`.
    ///
    /// Committing an offset that is already behind the consumer's position
    /// is a no-op.
    async fn commit(&self, consumer: &str, delivery: &Delivery) -> Result<()>;

    /// Number of partitions per topic.
    fn partitions(&self) -> u32;
}

/// Extension trait providing convenience methods for channels.
pub trait EventChannelExt: EventChannel {
    /// Opens a subscription for `consumer` on `topic`.
    fn subscribe(&self, topic: impl Into<String>, consumer: impl Into<String>) -> Subscription<'_, Self> {
        Subscription {
            channel: self,
            topic: topic.into(),
            consumer: consumer.into(),
            buffered: VecDeque::new(),
        }
    }
}

impl<T: EventChannel + ?Sized> EventChannelExt for T {}

/// A consumer's view of one topic.
///
/// `next` yields pending deliveries one by one, refilling from the channel
/// when its buffer runs dry. Deliveries that are never acknowledged come back
/// on a later refill.
pub struct Subscription<'a, C: EventChannel + ?Sized> {
    channel: &'a C,
    topic: String,
    consumer: String,
    buffered: VecDeque<Delivery>,
}

impl<C: EventChannel + ?Sized> Subscription<'_, C> {
    /// Returns the next pending delivery, or `None` when the topic is drained.
    pub async fn next(&mut self) -> Result<Option<Delivery>> {
        if self.buffered.is_empty() {
            let fetched = self.channel.fetch(&self.topic, &self.consumer).await?;
            self.buffered.extend(fetched);
        }
        Ok(self.buffered.pop_front())
    }

    /// Commits a delivery for this subscription's consumer.
    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.channel.commit(&self.consumer, delivery).await
    }

    /// Returns the topic this subscription reads.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_for_a_key() {
        let first = partition_for("SKU-001", 8);
        for _ in 0..10 {
            assert_eq!(partition_for("SKU-001", 8), first);
        }
        assert!(first < 8);
    }

    #[test]
    fn partition_for_known_value() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(partition_for("a", u32::MAX), 0xe40c_292c % u32::MAX);
    }

    #[test]
    fn zero_partitions_behaves_as_one() {
        assert_eq!(partition_for("anything", 0), 0);
    }
}
