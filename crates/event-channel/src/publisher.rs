//! Publishing with bounded retries and an outbox for messages the broker
//! would not take.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::{
    ChannelError, EventEnvelope, Result,
    channel::{EventChannel, PublishAck},
};

/// Retry behaviour for [`ReliablePublisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Total publish attempts before giving up (at least 1).
    pub max_attempts: u32,
    /// Upper bound on waiting for a broker acknowledgement per attempt.
    pub ack_timeout: Duration,
    /// Base delay between attempts; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Wraps a channel with retry-with-timeout publishing and an in-process outbox.
///
/// Cloning is cheap; clones share the same outbox.
#[derive(Clone)]
pub struct ReliablePublisher<C: EventChannel> {
    channel: C,
    config: PublisherConfig,
    outbox: Arc<Mutex<VecDeque<EventEnvelope>>>,
    /// Held for a whole flush; only the flusher removes outbox entries.
    flushing: Arc<Mutex<()>>,
}

impl<C: EventChannel> ReliablePublisher<C> {
    /// Creates a publisher with the default retry configuration.
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, PublisherConfig::default())
    }

    /// Creates a publisher with an explicit retry configuration.
    pub fn with_config(channel: C, config: PublisherConfig) -> Self {
        Self {
            channel,
            config,
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            flushing: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Publishes an envelope, retrying transient failures.
    ///
    /// Each attempt is bounded by `ack_timeout`. Non-transient errors are
    /// returned immediately.
    #[tracing::instrument(skip(self, envelope), fields(topic = %envelope.topic, event_type = %envelope.event_type))]
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<PublishAck> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome =
                tokio::time::timeout(self.config.ack_timeout, self.channel.publish(envelope.clone()))
                    .await;

            match outcome {
                Ok(Ok(ack)) => return Ok(ack),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "publish attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(attempt, "publish attempt timed out");
                    last_error = Some(ChannelError::AckTimeout {
                        topic: envelope.topic.clone(),
                        timeout_ms: self.config.ack_timeout.as_millis() as u64,
                    });
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }

        metrics::counter!("channel_publish_failures_total").increment(1);
        Err(last_error.unwrap_or_else(|| ChannelError::Unavailable("no attempts made".to_string())))
    }

    /// Publishes an envelope, queueing it in the outbox if every attempt fails.
    ///
    /// Returns the acknowledgement, or `None` if the envelope was queued. If
    /// the outbox already holds messages the envelope is queued behind them
    /// so per-key order is kept.
    pub async fn publish_or_enqueue(&self, envelope: EventEnvelope) -> Option<PublishAck> {
        if !self.outbox.lock().await.is_empty() {
            self.enqueue(envelope).await;
            return None;
        }

        match self.publish(&envelope).await {
            Ok(ack) => Some(ack),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    topic = %envelope.topic,
                    event_type = %envelope.event_type,
                    correlation_id = %envelope.correlation_id,
                    "publish failed, queued for re-publish"
                );
                self.enqueue(envelope).await;
                None
            }
        }
    }

    /// Re-publishes queued envelopes in order, stopping at the first failure.
    ///
    /// The head stays queued until the broker acknowledges it, so envelopes
    /// handed to [`publish_or_enqueue`](Self::publish_or_enqueue) during a
    /// flush line up behind it. Returns how many envelopes were published.
    #[tracing::instrument(skip(self))]
    pub async fn flush_outbox(&self) -> Result<usize> {
        let _flushing = self.flushing.lock().await;
        let mut published = 0;
        loop {
            let Some(envelope) = self.outbox.lock().await.front().cloned() else {
                break;
            };

            if let Err(e) = self.publish(&envelope).await {
                let depth = self.outbox.lock().await.len();
                metrics::gauge!("channel_outbox_depth").set(depth as f64);
                return Err(e);
            }

            let mut outbox = self.outbox.lock().await;
            outbox.pop_front();
            metrics::gauge!("channel_outbox_depth").set(outbox.len() as f64);
            published += 1;
        }

        if published > 0 {
            tracing::info!(published, "outbox flushed");
        }
        Ok(published)
    }

    /// Returns the number of envelopes waiting in the outbox.
    pub async fn pending(&self) -> usize {
        self.outbox.lock().await.len()
    }

    async fn enqueue(&self, envelope: EventEnvelope) {
        let mut outbox = self.outbox.lock().await;
        outbox.push_back(envelope);
        metrics::gauge!("channel_outbox_depth").set(outbox.len() as f64);
    }
}
