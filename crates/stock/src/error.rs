use common::ProductId;
use thiserror::Error;

use crate::lock::LockError;

/// Errors from the authoritative inventory table.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The product has no inventory row.
    #[error("Unknown product: {0}")]
    UnknownProduct(ProductId),

    /// The table could not be reached.
    #[error("Inventory unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl InventoryError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, InventoryError::Unavailable(_) | InventoryError::Database(_))
    }
}

/// Errors from stock ledger operations.
///
/// None of these mean "not enough stock"; that outcome is a plain `false`
/// from [`crate::StockLedger::try_reserve`].
#[derive(Debug, Error)]
pub enum StockError {
    /// The product's lock stayed busy for the whole wait budget.
    #[error("Timed out acquiring stock lock for {product_id}")]
    LockTimeout { product_id: ProductId },

    /// The lease ran out before the counter write, so the write was skipped.
    #[error("Stock lock lease for {product_id} expired before the write")]
    LeaseExpired { product_id: ProductId },

    /// The counter store could not be reached.
    #[error("Stock store unavailable: {0}")]
    StoreUnavailable(String),

    /// Neither the counter store nor the inventory table knows the product.
    #[error("Unknown product: {0}")]
    UnknownProduct(ProductId),

    #[error("Lock error: {0}")]
    Lock(LockError),

    #[error("Inventory error: {0}")]
    Inventory(InventoryError),
}

impl StockError {
    /// Returns true for infrastructure failures that are safe to retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StockError::LockTimeout { .. }
            | StockError::LeaseExpired { .. }
            | StockError::StoreUnavailable(_)
            | StockError::Lock(_) => true,
            StockError::Inventory(e) => e.is_transient(),
            StockError::UnknownProduct(_) => false,
        }
    }
}

impl From<InventoryError> for StockError {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::UnknownProduct(product_id) => StockError::UnknownProduct(product_id),
            other => StockError::Inventory(other),
        }
    }
}

/// Result type for stock ledger operations.
pub type Result<T> = std::result::Result<T, StockError>;
