//! Order record, status state machine and related types.

mod entity;
mod status;
mod value_objects;

pub use entity::{Order, StatusTransition};
pub use status::{OrderStatus, UnknownStatus};
pub use value_objects::{LineItem, Money, OrderLine};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Order is not in a status that allows the action.
    #[error("Invalid state transition: cannot {action} from {current} status")]
    InvalidStateTransition {
        current: OrderStatus,
        action: &'static str,
    },

    /// Return requested after the return window closed.
    #[error("Return window expired: delivered at {delivered_at}")]
    ReturnWindowExpired { delivered_at: DateTime<Utc> },

    /// Invalid quantity.
    #[error("Invalid quantity for {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { product_id: String, quantity: u32 },

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,
}
