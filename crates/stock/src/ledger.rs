//! Per-product available-quantity counters with serialized updates.

use std::collections::HashMap;

use async_trait::async_trait;
use common::ProductId;

use crate::{
    CounterStore, InventoryTable, Result, StockError,
    lock::{LeaseLock, LockConfig, LockError, LockHandle},
};

/// Available stock per product.
///
/// Every write happens inside a per-product critical section. Running out of
/// stock is an ordinary `false` from [`StockLedger::try_reserve`]; errors are
/// reserved for infrastructure trouble and unknown products.
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Takes `quantity` units if at least that many are available.
    async fn try_reserve(&self, product_id: &ProductId, quantity: u32) -> Result<bool>;

    /// Gives `quantity` units back.
    async fn release(&self, product_id: &ProductId, quantity: u32) -> Result<()>;

    /// Sets the counter to an absolute value.
    async fn initialize(&self, product_id: &ProductId, quantity: i64) -> Result<()>;

    /// Resets the counter to `target` only if it still reads `expected`.
    ///
    /// Returns false, leaving the counter alone, if it moved in between.
    async fn compare_and_reset(
        &self,
        product_id: &ProductId,
        expected: i64,
        target: i64,
    ) -> Result<bool>;

    /// Returns the counter, or `None` if it is not loaded.
    async fn available(&self, product_id: &ProductId) -> Result<Option<i64>>;

    /// Returns every loaded counter.
    async fn snapshot(&self) -> Result<HashMap<ProductId, i64>>;
}

/// Stock ledger over a counter cache, guarded by a lease lock per product.
///
/// A counter missing from the cache is seeded from the inventory table the
/// first time it is touched, under the product's lock.
#[derive(Clone)]
pub struct CacheStockLedger<L, S, I>
where
    L: LeaseLock,
    S: CounterStore,
    I: InventoryTable,
{
    lock: L,
    store: S,
    inventory: I,
    config: LockConfig,
}

impl<L, S, I> CacheStockLedger<L, S, I>
where
    L: LeaseLock,
    S: CounterStore,
    I: InventoryTable,
{
    /// Creates a ledger with the default lock wait and lease.
    pub fn new(lock: L, store: S, inventory: I) -> Self {
        Self::with_config(lock, store, inventory, LockConfig::default())
    }

    /// Creates a ledger with explicit lock settings.
    pub fn with_config(lock: L, store: S, inventory: I, config: LockConfig) -> Self {
        Self {
            lock,
            store,
            inventory,
            config,
        }
    }

    /// Returns the counter store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the inventory table counters are seeded from.
    pub fn inventory(&self) -> &I {
        &self.inventory
    }

    fn lock_key(product_id: &ProductId) -> String {
        format!("stock:{product_id}")
    }

    async fn acquire(&self, product_id: &ProductId) -> Result<LockHandle> {
        self.lock
            .try_acquire(
                &Self::lock_key(product_id),
                self.config.wait,
                self.config.lease,
            )
            .await
            .map_err(|e| match e {
                LockError::Timeout { .. } => {
                    metrics::counter!("stock_lock_timeouts_total").increment(1);
                    StockError::LockTimeout {
                        product_id: product_id.clone(),
                    }
                }
                other => StockError::Lock(other),
            })
    }

    async fn unlock(&self, handle: &LockHandle) {
        if let Err(e) = self.lock.release(handle).await {
            // The lease already ran out; the next holder owns the key now.
            tracing::warn!(key = handle.key(), error = %e, "stock lock release failed");
        }
    }

    /// Reads the counter, seeding it from the inventory table if absent.
    async fn load_or_seed(&self, product_id: &ProductId) -> Result<i64> {
        if let Some(quantity) = self.store.get(product_id).await? {
            return Ok(quantity);
        }

        let quantity = self
            .inventory
            .quantity(product_id)
            .await?
            .ok_or_else(|| StockError::UnknownProduct(product_id.clone()))?;
        self.store.set(product_id, quantity).await?;
        tracing::info!(%product_id, quantity, "stock counter seeded from inventory");
        Ok(quantity)
    }

    async fn write(&self, handle: &LockHandle, product_id: &ProductId, quantity: i64) -> Result<()> {
        if handle.is_expired() {
            return Err(StockError::LeaseExpired {
                product_id: product_id.clone(),
            });
        }
        self.store.set(product_id, quantity).await
    }

    async fn reserve_locked(
        &self,
        handle: &LockHandle,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<bool> {
        let available = self.load_or_seed(product_id).await?;
        let requested = i64::from(quantity);
        if available < requested {
            return Ok(false);
        }
        self.write(handle, product_id, available - requested).await?;
        Ok(true)
    }

    async fn release_locked(
        &self,
        handle: &LockHandle,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<()> {
        let available = self.load_or_seed(product_id).await?;
        self.write(handle, product_id, available + i64::from(quantity))
            .await
    }

    async fn reset_locked(
        &self,
        handle: &LockHandle,
        product_id: &ProductId,
        expected: i64,
        target: i64,
    ) -> Result<bool> {
        if self.store.get(product_id).await? != Some(expected) {
            return Ok(false);
        }
        self.write(handle, product_id, target).await?;
        Ok(true)
    }
}

#[async_trait]
impl<L, S, I> StockLedger for CacheStockLedger<L, S, I>
where
    L: LeaseLock,
    S: CounterStore,
    I: InventoryTable,
{
    #[tracing::instrument(skip(self))]
    async fn try_reserve(&self, product_id: &ProductId, quantity: u32) -> Result<bool> {
        let handle = self.acquire(product_id).await?;
        let result = self.reserve_locked(&handle, product_id, quantity).await;
        self.unlock(&handle).await;
        result
    }

    #[tracing::instrument(skip(self))]
    async fn release(&self, product_id: &ProductId, quantity: u32) -> Result<()> {
        let handle = self.acquire(product_id).await?;
        let result = self.release_locked(&handle, product_id, quantity).await;
        self.unlock(&handle).await;
        result
    }

    async fn initialize(&self, product_id: &ProductId, quantity: i64) -> Result<()> {
        let handle = self.acquire(product_id).await?;
        let result = self.write(&handle, product_id, quantity.max(0)).await;
        self.unlock(&handle).await;
        result
    }

    async fn compare_and_reset(
        &self,
        product_id: &ProductId,
        expected: i64,
        target: i64,
    ) -> Result<bool> {
        let handle = self.acquire(product_id).await?;
        let result = self
            .reset_locked(&handle, product_id, expected, target.max(0))
            .await;
        self.unlock(&handle).await;
        result
    }

    async fn available(&self, product_id: &ProductId) -> Result<Option<i64>> {
        self.store.get(product_id).await
    }

    async fn snapshot(&self) -> Result<HashMap<ProductId, i64>> {
        self.store.entries().await
    }
}
