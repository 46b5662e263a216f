use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EventEnvelope, EventId, Result,
    channel::{Delivery, EventChannel, PublishAck, partition_for},
};

/// PostgreSQL-backed event channel.
///
/// Messages live in `channel_messages` and consumer positions in
/// `channel_offsets`. Offsets come from the partition's row in
/// `channel_partition_heads`, bumped in the publishing transaction; its row
/// lock makes publishers to one partition commit in offset order, so a
/// consumer never moves past an offset that is still being written.
#[derive(Clone)]
pub struct PostgresEventChannel {
    pool: PgPool,
    partitions: u32,
}

impl PostgresEventChannel {
    /// Creates a new PostgreSQL event channel.
    pub fn new(pool: PgPool, partitions: u32) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_delivery(row: PgRow) -> Result<Delivery> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;
        let partition: i32 = row.try_get("partition")?;
        let offset: i64 = row.try_get("log_offset")?;

        Ok(Delivery {
            envelope: EventEnvelope {
                event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
                topic: row.try_get("topic")?,
                key: row.try_get("key")?,
                event_type: row.try_get("event_type")?,
                correlation_id: row.try_get("correlation_id")?,
                emitted_at: row.try_get("emitted_at")?,
                payload: row.try_get("payload")?,
                metadata,
            },
            partition: partition as u32,
            offset: offset as u64,
        })
    }
}

#[async_trait]
impl EventChannel for PostgresEventChannel {
    #[tracing::instrument(skip(self, envelope), fields(topic = %envelope.topic, event_type = %envelope.event_type))]
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishAck> {
        let partition = partition_for(&envelope.key, self.partitions);
        let metadata_json = serde_json::to_value(&envelope.metadata)?;

        let mut tx = self.pool.begin().await?;

        let offset: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO channel_partition_heads (topic, partition, next_offset)
            VALUES ($1, $2, 1)
            ON CONFLICT (topic, partition)
            DO UPDATE SET next_offset = channel_partition_heads.next_offset + 1
            RETURNING next_offset - 1
            "#,
        )
        .bind(&envelope.topic)
        .bind(partition as i32)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO channel_messages
                (event_id, topic, partition, log_offset, key, event_type, correlation_id, emitted_at, payload, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(envelope.event_id.as_uuid())
        .bind(&envelope.topic)
        .bind(partition as i32)
        .bind(offset)
        .bind(&envelope.key)
        .bind(&envelope.event_type)
        .bind(&envelope.correlation_id)
        .bind(envelope.emitted_at)
        .bind(&envelope.payload)
        .bind(metadata_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PublishAck {
            topic: envelope.topic,
            partition,
            offset: offset as u64,
        })
    }

    async fn fetch(&self, topic: &str, consumer: &str) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (m.partition)
                m.log_offset, m.event_id, m.topic, m.partition, m.key, m.event_type,
                m.correlation_id, m.emitted_at, m.payload, m.metadata
            FROM channel_messages m
            LEFT JOIN channel_offsets o
                ON o.consumer = $2 AND o.topic = m.topic AND o.partition = m.partition
            WHERE m.topic = $1 AND m.log_offset >= COALESCE(o.next_offset, 0)
            ORDER BY m.partition, m.log_offset
            "#,
        )
        .bind(topic)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_delivery).collect()
    }

    async fn commit(&self, consumer: &str, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_offsets (consumer, topic, partition, next_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (consumer, topic, partition)
            DO UPDATE SET next_offset = GREATEST(channel_offsets.next_offset, EXCLUDED.next_offset)
            "#,
        )
        .bind(consumer)
        .bind(&delivery.envelope.topic)
        .bind(delivery.partition as i32)
        .bind(delivery.offset as i64 + 1)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }
}
