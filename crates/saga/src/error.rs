//! Fulfillment error types.

use chrono::{DateTime, Utc};
use common::{OrderId, ProductId};
use domain::{OrderError, OrderStatus};
use event_channel::ChannelError;
use stock::InventoryError;
use thiserror::Error;

use crate::payment::PaymentError;

/// Caller-facing error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InsufficientStock,
    Transient,
    InvalidProduct,
    InvalidRequest,
    NotFound,
    Forbidden,
    InvalidState,
    ReturnWindowExpired,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
            ErrorCode::Transient => "TRANSIENT",
            ErrorCode::InvalidProduct => "INVALID_PRODUCT",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::ReturnWindowExpired => "RETURN_WINDOW_EXPIRED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors returned by order operations.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// Not enough stock for one of the requested products.
    #[error("Insufficient stock for product {product_id}")]
    InsufficientStock { product_id: ProductId },

    /// Infrastructure trouble; the same request may succeed later.
    #[error("{0}")]
    Transient(String),

    /// A requested product does not exist.
    #[error("Invalid product: {0}")]
    InvalidProduct(ProductId),

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No order with this ID.
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// The order belongs to another member.
    #[error("Order {0} belongs to another member")]
    Forbidden(OrderId),

    /// The order's status does not allow the action.
    #[error("Cannot {action} an order in {current} status")]
    InvalidState {
        current: OrderStatus,
        action: &'static str,
    },

    /// The return window closed.
    #[error("Return window expired: delivered at {delivered_at}")]
    ReturnWindowExpired { delivered_at: DateTime<Utc> },
}

impl FulfillmentError {
    /// Builds a [`FulfillmentError::Transient`], logging the internal cause.
    ///
    /// The returned message never carries lock names, timings, or driver text.
    pub fn transient(cause: impl std::fmt::Display) -> Self {
        tracing::warn!(error = %cause, "transient infrastructure failure");
        FulfillmentError::Transient("service temporarily unavailable, please retry".to_string())
    }

    /// Returns the caller-facing error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            FulfillmentError::InsufficientStock { .. } => ErrorCode::InsufficientStock,
            FulfillmentError::Transient(_) => ErrorCode::Transient,
            FulfillmentError::InvalidProduct(_) => ErrorCode::InvalidProduct,
            FulfillmentError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            FulfillmentError::NotFound(_) => ErrorCode::NotFound,
            FulfillmentError::Forbidden(_) => ErrorCode::Forbidden,
            FulfillmentError::InvalidState { .. } => ErrorCode::InvalidState,
            FulfillmentError::ReturnWindowExpired { .. } => ErrorCode::ReturnWindowExpired,
        }
    }

    /// Returns true if the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        self.code() == ErrorCode::Transient
    }
}

impl From<OrderError> for FulfillmentError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::InvalidStateTransition { current, action } => {
                FulfillmentError::InvalidState { current, action }
            }
            OrderError::ReturnWindowExpired { delivered_at } => {
                FulfillmentError::ReturnWindowExpired { delivered_at }
            }
            OrderError::InvalidQuantity { .. } | OrderError::NoItems => {
                FulfillmentError::InvalidRequest(err.to_string())
            }
        }
    }
}

/// Errors from handling a delivered message.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Payment history error: {0}")]
    Payment(#[from] PaymentError),

    /// The message is on a topic this listener does not handle.
    #[error("Unexpected topic: {0}")]
    UnexpectedTopic(String),
}

/// Convenience type alias for fulfillment results.
pub type Result<T> = std::result::Result<T, FulfillmentError>;
