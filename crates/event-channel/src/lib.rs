//! Partitioned, at-least-once event channel.
//!
//! - [`EventChannel`] trait: publish, fetch and commit against per-topic partitions
//! - [`InMemoryEventChannel`] for tests and single-node deployments
//! - [`PostgresEventChannel`] for durable deployments
//! - [`ReliablePublisher`] adding bounded retries and an outbox

pub mod channel;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod publisher;

pub use channel::{
    Delivery, EventChannel, EventChannelExt, PublishAck, Subscription, partition_for,
};
pub use error::{ChannelError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId};
pub use memory::InMemoryEventChannel;
pub use postgres::PostgresEventChannel;
pub use publisher::{PublisherConfig, ReliablePublisher};
