//! Persistence of orders with atomic status changes.

mod memory;
mod postgres;

pub use memory::InMemoryOrderLedger;
pub use postgres::PostgresOrderLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MemberId, OrderId};
use thiserror::Error;

use crate::order::{Order, OrderStatus, StatusTransition};

/// Errors that can occur when interacting with an order ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No order with this ID.
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// The stored status no longer matches the status a change was decided on.
    #[error("Stale status for order {order_id}: expected {expected}, found {actual}")]
    StaleStatus {
        order_id: OrderId,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    /// An order already exists for this owner and idempotency key, or with this ID.
    #[error("Duplicate order for owner {owner_id}")]
    DuplicateOrder { owner_id: MemberId },

    /// The transition is not a legal move of the state machine.
    #[error("Illegal transition for order {order_id}: {from} -> {to}")]
    IllegalTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// The backing store could not be reached.
    #[error("Order store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt order record: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::Database(_))
    }
}

/// Result type for order ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Core trait for order ledger implementations.
///
/// A ledger stores each order together with its line snapshot and is the only
/// place a status is written. Status writes are compare-and-set on the current
/// status, so two writers racing on one order cannot both win.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Persists a new order and its lines atomically.
    ///
    /// Fails with [`LedgerError::DuplicateOrder`] if the order carries an
    /// idempotency key already used by the same owner.
    async fn insert(&self, order: &Order) -> Result<()>;

    /// Loads an order by ID.
    async fn get(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Loads the order an owner created with a given idempotency key.
    async fn find_by_idempotency_key(&self, owner_id: MemberId, key: &str)
    -> Result<Option<Order>>;

    /// Applies `transition` only if the stored status still equals
    /// `transition.from`, returning the updated order.
    async fn compare_and_set_status(&self, transition: &StatusTransition) -> Result<Order>;

    /// Returns orders in `status` that entered it at or before `cutoff`,
    /// oldest first.
    async fn list_due(&self, status: OrderStatus, cutoff: DateTime<Utc>) -> Result<Vec<Order>>;
}

pub(crate) fn check_transition(transition: &StatusTransition) -> Result<()> {
    if transition.from.can_transition_to(transition.to) {
        Ok(())
    } else {
        Err(LedgerError::IllegalTransition {
            order_id: transition.order_id,
            from: transition.from,
            to: transition.to,
        })
    }
}
