//! Source-of-truth product quantities.
//!
//! The inventory table lags the stock ledger: it moves only when a
//! `STOCK_REDUCED`/`STOCK_RESTORED` event is applied. Each adjustment carries
//! a dedupe key so redelivered events are applied once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::ProductId;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use crate::InventoryError;

/// Result of applying an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentOutcome {
    /// The quantity changed; carries the new quantity.
    Applied(i64),
    /// An adjustment with the same dedupe key was applied before.
    AlreadyApplied,
}

/// Authoritative per-product quantities.
#[async_trait]
pub trait InventoryTable: Send + Sync {
    /// Sets a product's quantity, creating the row if needed.
    async fn seed(&self, product_id: &ProductId, quantity: i64) -> Result<(), InventoryError>;

    /// Returns the quantity, or `None` for an unknown product.
    async fn quantity(&self, product_id: &ProductId) -> Result<Option<i64>, InventoryError>;

    /// Adds `delta` to a product's quantity unless `dedupe_key` was seen.
    ///
    /// The quantity never goes below zero; an adjustment that would do so is
    /// clamped and logged.
    async fn apply_adjustment(
        &self,
        product_id: &ProductId,
        delta: i64,
        dedupe_key: &str,
    ) -> Result<AdjustmentOutcome, InventoryError>;

    /// Returns every product's quantity.
    async fn all_quantities(&self) -> Result<HashMap<ProductId, i64>, InventoryError>;
}

#[derive(Default)]
struct InventoryState {
    quantities: HashMap<ProductId, i64>,
    applied: HashSet<String>,
}

/// In-memory inventory table for tests and single-node deployments.
#[derive(Clone, Default)]
pub struct InMemoryInventoryTable {
    state: Arc<RwLock<InventoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryInventoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns how many distinct adjustments were applied.
    pub async fn adjustment_count(&self) -> usize {
        self.state.read().await.applied.len()
    }

    fn check_available(&self) -> Result<(), InventoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(InventoryError::Unavailable("inventory unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryTable for InMemoryInventoryTable {
    async fn seed(&self, product_id: &ProductId, quantity: i64) -> Result<(), InventoryError> {
        self.check_available()?;
        self.state
            .write()
            .await
            .quantities
            .insert(product_id.clone(), quantity.max(0));
        Ok(())
    }

    async fn quantity(&self, product_id: &ProductId) -> Result<Option<i64>, InventoryError> {
        self.check_available()?;
        Ok(self.state.read().await.quantities.get(product_id).copied())
    }

    async fn apply_adjustment(
        &self,
        product_id: &ProductId,
        delta: i64,
        dedupe_key: &str,
    ) -> Result<AdjustmentOutcome, InventoryError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.applied.contains(dedupe_key) {
            return Ok(AdjustmentOutcome::AlreadyApplied);
        }

        let quantity = state
            .quantities
            .get_mut(product_id)
            .ok_or_else(|| InventoryError::UnknownProduct(product_id.clone()))?;
        let target = *quantity + delta;
        if target < 0 {
            tracing::warn!(%product_id, delta, current = *quantity, "adjustment clamped at zero");
        }
        *quantity = target.max(0);
        let updated = *quantity;

        state.applied.insert(dedupe_key.to_string());
        Ok(AdjustmentOutcome::Applied(updated))
    }

    async fn all_quantities(&self) -> Result<HashMap<ProductId, i64>, InventoryError> {
        self.check_available()?;
        Ok(self.state.read().await.quantities.clone())
    }
}

/// PostgreSQL-backed inventory table.
///
/// Quantities live in `inventory`; applied dedupe keys in
/// `inventory_adjustments`, written in the same transaction as the change.
#[derive(Clone)]
pub struct PostgresInventoryTable {
    pool: PgPool,
}

impl PostgresInventoryTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl InventoryTable for PostgresInventoryTable {
    async fn seed(&self, product_id: &ProductId, quantity: i64) -> Result<(), InventoryError> {
        sqlx::query(
            r#"
            INSERT INTO inventory (product_id, quantity, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (product_id)
            DO UPDATE SET quantity = EXCLUDED.quantity, updated_at = NOW()
            "#,
        )
        .bind(product_id.as_str())
        .bind(quantity.max(0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn quantity(&self, product_id: &ProductId) -> Result<Option<i64>, InventoryError> {
        let quantity = sqlx::query_scalar("SELECT quantity FROM inventory WHERE product_id = $1")
            .bind(product_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(quantity)
    }

    #[tracing::instrument(skip(self))]
    async fn apply_adjustment(
        &self,
        product_id: &ProductId,
        delta: i64,
        dedupe_key: &str,
    ) -> Result<AdjustmentOutcome, InventoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO inventory_adjustments (dedupe_key, product_id, delta, applied_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (dedupe_key) DO NOTHING
            "#,
        )
        .bind(dedupe_key)
        .bind(product_id.as_str())
        .bind(delta)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(AdjustmentOutcome::AlreadyApplied);
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT quantity FROM inventory WHERE product_id = $1 FOR UPDATE")
                .bind(product_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            tx.rollback().await?;
            return Err(InventoryError::UnknownProduct(product_id.clone()));
        };

        let target = current + delta;
        if target < 0 {
            tracing::warn!(%product_id, delta, current, "adjustment clamped at zero");
        }
        let updated = target.max(0);

        sqlx::query("UPDATE inventory SET quantity = $2, updated_at = NOW() WHERE product_id = $1")
            .bind(product_id.as_str())
            .bind(updated)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(AdjustmentOutcome::Applied(updated))
    }

    async fn all_quantities(&self) -> Result<HashMap<ProductId, i64>, InventoryError> {
        let rows = sqlx::query("SELECT product_id, quantity FROM inventory")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let product_id: String = row.try_get("product_id")?;
                Ok((ProductId::new(product_id), row.try_get("quantity")?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adjustments_apply_once() {
        let table = InMemoryInventoryTable::new();
        let sku = ProductId::new("SKU-1");
        table.seed(&sku, 10).await.unwrap();

        let first = table.apply_adjustment(&sku, -3, "STOCK_REDUCED:o-1:SKU-1").await;
        assert_eq!(first.unwrap(), AdjustmentOutcome::Applied(7));

        let again = table.apply_adjustment(&sku, -3, "STOCK_REDUCED:o-1:SKU-1").await;
        assert_eq!(again.unwrap(), AdjustmentOutcome::AlreadyApplied);
        assert_eq!(table.quantity(&sku).await.unwrap(), Some(7));
        assert_eq!(table.adjustment_count().await, 1);
    }

    #[tokio::test]
    async fn negative_result_is_clamped() {
        let table = InMemoryInventoryTable::new();
        let sku = ProductId::new("SKU-1");
        table.seed(&sku, 2).await.unwrap();

        let outcome = table.apply_adjustment(&sku, -5, "k").await.unwrap();
        assert_eq!(outcome, AdjustmentOutcome::Applied(0));
    }

    #[tokio::test]
    async fn unknown_product_is_rejected_without_recording_key() {
        let table = InMemoryInventoryTable::new();
        let sku = ProductId::new("SKU-404");

        let result = table.apply_adjustment(&sku, 1, "k").await;
        assert!(matches!(result, Err(InventoryError::UnknownProduct(_))));
        assert_eq!(table.adjustment_count().await, 0);
    }

    #[tokio::test]
    async fn unavailable_is_transient() {
        let table = InMemoryInventoryTable::new();
        table.set_unavailable(true);
        let err = table.quantity(&ProductId::new("SKU-1")).await.unwrap_err();
        assert!(err.is_transient());
    }
}
