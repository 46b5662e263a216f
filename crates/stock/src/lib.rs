//! Stock counters for the order-fulfillment system.
//!
//! - `LeaseLock`: short-lived exclusive leases, one per product
//! - `StockLedger`: available quantities, updated only under the product's lease
//! - `InventoryTable`: authoritative quantities, moved by idempotent adjustments
//! - `Reconciler`: finds and repairs counters that drifted from the table

pub mod counter;
pub mod error;
pub mod inventory;
pub mod ledger;
pub mod lock;
pub mod reconcile;

pub use common::ProductId;
pub use counter::{CounterStore, InMemoryCounterStore};
pub use error::{InventoryError, Result, StockError};
pub use inventory::{
    AdjustmentOutcome, InMemoryInventoryTable, InventoryTable, PostgresInventoryTable,
};
pub use ledger::{CacheStockLedger, StockLedger};
pub use lock::{InMemoryLeaseLock, LeaseLock, LockConfig, LockError, LockHandle};
pub use reconcile::{Drift, ReconcileReport, Reconciler, ReconcilerConfig};

/// Stock ledger backed entirely by process memory.
pub type InMemoryStockLedger<I = InMemoryInventoryTable> =
    CacheStockLedger<InMemoryLeaseLock, InMemoryCounterStore, I>;

impl<I: InventoryTable> InMemoryStockLedger<I> {
    /// Creates an in-memory ledger seeded lazily from `inventory`.
    pub fn in_memory(inventory: I, config: LockConfig) -> Self {
        CacheStockLedger::with_config(
            InMemoryLeaseLock::new(),
            InMemoryCounterStore::new(),
            inventory,
            config,
        )
    }
}
