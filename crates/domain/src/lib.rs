//! Domain layer for the order-fulfillment system.
//!
//! This crate provides:
//! - The `Order` record with its line snapshots and status state machine
//! - `OrderLedger` persistence with compare-and-set status changes
//! - The `Catalog` used to price order lines
//! - Typed `StockEvent`/`OrderEvent` messages for the event channel

pub mod catalog;
pub mod events;
pub mod ledger;
pub mod order;

pub use catalog::{Catalog, CatalogError, InMemoryCatalog, ProductInfo};
pub use common::{MemberId, OrderId, ProductId};
pub use events::{ChannelMessage, OrderEvent, OrderEventType, StockEvent, StockEventType};
pub use ledger::{InMemoryOrderLedger, LedgerError, OrderLedger, PostgresOrderLedger};
pub use order::{
    LineItem, Money, Order, OrderError, OrderLine, OrderStatus, StatusTransition, UnknownStatus,
};
