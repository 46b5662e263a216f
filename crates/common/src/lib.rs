//! Shared identifiers for the order-fulfillment workspace.

mod types;

pub use types::{MemberId, OrderId, ProductId};
