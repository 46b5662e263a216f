use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MemberId, OrderId, ProductId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{LedgerError, OrderLedger, Result, check_transition};
use crate::order::{Money, Order, OrderLine, OrderStatus, StatusTransition};

const ORDER_COLUMNS: &str = "id, owner_id, total_amount_cents, status, created_at, \
     delivery_start_date, delivery_complete_date, return_request_date, idempotency_key";

/// PostgreSQL-backed order ledger.
#[derive(Clone)]
pub struct PostgresOrderLedger {
    pool: PgPool,
}

impl PostgresOrderLedger {
    /// Creates a new PostgreSQL order ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Column holding the time an order entered `status`.
    fn entered_at_column(status: OrderStatus) -> Option<&'static str> {
        match status {
            OrderStatus::OrderReceived => Some("created_at"),
            OrderStatus::Delivering => Some("delivery_start_date"),
            OrderStatus::DeliveryCompleted => Some("delivery_complete_date"),
            OrderStatus::ReturnRequested => Some("return_request_date"),
            OrderStatus::Cancelled | OrderStatus::ReturnCompleted => None,
        }
    }

    /// Column value for a line quantity; `order_lines.quantity` is an INTEGER.
    fn quantity_to_column(line: &OrderLine) -> Result<i32> {
        i32::try_from(line.quantity).map_err(|_| {
            LedgerError::Corrupt(format!(
                "quantity {} of {} exceeds the storable range",
                line.quantity, line.product_id
            ))
        })
    }

    fn quantity_from_column(quantity: i32) -> Result<u32> {
        u32::try_from(quantity)
            .map_err(|_| LedgerError::Corrupt(format!("negative line quantity {quantity}")))
    }

    fn row_to_order(row: &PgRow, lines: Vec<OrderLine>) -> Result<Order> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<OrderStatus>()
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;

        Ok(Order {
            id: OrderId::from_uuid(row.try_get("id")?),
            owner_id: MemberId::from_uuid(row.try_get("owner_id")?),
            total_amount: Money::from_cents(row.try_get("total_amount_cents")?),
            status,
            created_at: row.try_get("created_at")?,
            delivery_start_date: row.try_get("delivery_start_date")?,
            delivery_complete_date: row.try_get("delivery_complete_date")?,
            return_request_date: row.try_get("return_request_date")?,
            lines,
            idempotency_key: row.try_get("idempotency_key")?,
        })
    }

    async fn fetch_lines(&self, order_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<OrderLine>>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, product_name, unit_price_cents, quantity
            FROM order_lines
            WHERE order_id = ANY($1)
            ORDER BY order_id, line_no
            "#,
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut lines: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
        for row in rows {
            let line = OrderLine {
                product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
                product_name: row.try_get("product_name")?,
                unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
                quantity: Self::quantity_from_column(row.try_get("quantity")?)?,
            };
            lines.entry(row.try_get("order_id")?).or_default().push(line);
        }
        Ok(lines)
    }

    async fn rows_to_orders(&self, rows: Vec<PgRow>) -> Result<Vec<Order>> {
        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut lines = self.fetch_lines(&ids).await?;

        rows.iter()
            .zip(ids)
            .map(|(row, id)| Self::row_to_order(row, lines.remove(&id).unwrap_or_default()))
            .collect()
    }
}

#[async_trait]
impl OrderLedger for PostgresOrderLedger {
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id()))]
    async fn insert(&self, order: &Order) -> Result<()> {
        let quantities = order
            .lines
            .iter()
            .map(Self::quantity_to_column)
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders
                (id, owner_id, total_amount_cents, status, created_at,
                 delivery_start_date, delivery_complete_date, return_request_date, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.owner_id.as_uuid())
        .bind(order.total_amount.cents())
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.delivery_start_date)
        .bind(order.delivery_complete_date)
        .bind(order.return_request_date)
        .bind(&order.idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && (db_err.constraint() == Some("unique_owner_idempotency_key")
                    || db_err.constraint() == Some("orders_pkey"))
            {
                return LedgerError::DuplicateOrder {
                    owner_id: order.owner_id,
                };
            }
            LedgerError::Database(e)
        })?;

        for (line_no, (line, quantity)) in order.lines.iter().zip(quantities).enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_lines
                    (order_id, line_no, product_id, product_name, unit_price_cents, quantity)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id.as_uuid())
            .bind(line_no as i32)
            .bind(line.product_id.as_str())
            .bind(&line.product_name)
            .bind(line.unit_price.cents())
            .bind(quantity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let rows = sqlx::query(&sql)
            .bind(order_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        Ok(self.rows_to_orders(rows).await?.pop())
    }

    async fn find_by_idempotency_key(
        &self,
        owner_id: MemberId,
        key: &str,
    ) -> Result<Option<Order>> {
        let sql =
            format!("SELECT {ORDER_COLUMNS} FROM orders WHERE owner_id = $1 AND idempotency_key = $2");
        let rows = sqlx::query(&sql)
            .bind(owner_id.as_uuid())
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(self.rows_to_orders(rows).await?.pop())
    }

    #[tracing::instrument(skip(self), fields(order_id = %transition.order_id))]
    async fn compare_and_set_status(&self, transition: &StatusTransition) -> Result<Order> {
        check_transition(transition)?;

        // A legal target is never ORDER_RECEIVED, so created_at is never rewritten.
        let date_column = Self::entered_at_column(transition.to);
        let sql = match date_column {
            Some(column) => format!(
                "UPDATE orders SET status = $3, {column} = $4 \
                 WHERE id = $1 AND status = $2 RETURNING {ORDER_COLUMNS}"
            ),
            None => format!(
                "UPDATE orders SET status = $3 \
                 WHERE id = $1 AND status = $2 RETURNING {ORDER_COLUMNS}"
            ),
        };

        let mut query = sqlx::query(&sql)
            .bind(transition.order_id.as_uuid())
            .bind(transition.from.as_str())
            .bind(transition.to.as_str());
        if date_column.is_some() {
            query = query.bind(transition.at);
        }

        // The returned row is the one this update wrote, not a later state.
        if let Some(row) = query.fetch_optional(&self.pool).await? {
            return self
                .rows_to_orders(vec![row])
                .await?
                .pop()
                .ok_or(LedgerError::NotFound(transition.order_id));
        }

        let current = self
            .get(transition.order_id)
            .await?
            .ok_or(LedgerError::NotFound(transition.order_id))?;
        Err(LedgerError::StaleStatus {
            order_id: transition.order_id,
            expected: transition.from,
            actual: current.status,
        })
    }

    async fn list_due(&self, status: OrderStatus, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        let Some(column) = Self::entered_at_column(status) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = $1 AND {column} <= $2 ORDER BY {column}"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        self.rows_to_orders(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(quantity: u32) -> OrderLine {
        OrderLine::new(ProductId::new("SKU-1"), "Widget", Money::from_cents(100), quantity)
    }

    #[test]
    fn test_quantity_beyond_integer_column_is_rejected() {
        assert_eq!(PostgresOrderLedger::quantity_to_column(&line(3)).unwrap(), 3);
        assert_eq!(
            PostgresOrderLedger::quantity_to_column(&line(i32::MAX as u32)).unwrap(),
            i32::MAX
        );
        assert!(matches!(
            PostgresOrderLedger::quantity_to_column(&line(i32::MAX as u32 + 1)),
            Err(LedgerError::Corrupt(_))
        ));
    }

    #[test]
    fn test_negative_stored_quantity_is_corrupt() {
        assert_eq!(PostgresOrderLedger::quantity_from_column(7).unwrap(), 7);
        assert!(matches!(
            PostgresOrderLedger::quantity_from_column(-1),
            Err(LedgerError::Corrupt(_))
        ));
    }
}
