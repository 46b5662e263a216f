//! Keyed stock counters (`productId -> quantity`).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::ProductId;
use tokio::sync::RwLock;

use crate::{Result, StockError};

/// Raw storage for stock counters.
///
/// Plain reads and writes with no locking of their own; callers serialize
/// writes per product through a lease lock.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Returns the counter, or `None` if it is not present (never set or evicted).
    async fn get(&self, product_id: &ProductId) -> Result<Option<i64>>;

    /// Overwrites the counter.
    async fn set(&self, product_id: &ProductId, quantity: i64) -> Result<()>;

    /// Drops the counter.
    async fn evict(&self, product_id: &ProductId) -> Result<()>;

    /// Returns every present counter.
    async fn entries(&self) -> Result<HashMap<ProductId, i64>>;
}

/// Counter store kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<RwLock<HashMap<ProductId, i64>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail as if the cache were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StockError::StoreUnavailable("counter store unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, product_id: &ProductId) -> Result<Option<i64>> {
        self.check_available()?;
        Ok(self.counters.read().await.get(product_id).copied())
    }

    async fn set(&self, product_id: &ProductId, quantity: i64) -> Result<()> {
        self.check_available()?;
        self.counters
            .write()
            .await
            .insert(product_id.clone(), quantity);
        Ok(())
    }

    async fn evict(&self, product_id: &ProductId) -> Result<()> {
        self.check_available()?;
        self.counters.write().await.remove(product_id);
        Ok(())
    }

    async fn entries(&self) -> Result<HashMap<ProductId, i64>> {
        self.check_available()?;
        Ok(self.counters.read().await.clone())
    }
}
